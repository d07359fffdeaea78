use tally_expr::ast::{BinaryOp, CompareOp, Constant, Expr, Stmt};
use tally_expr::parse;

fn single_expr(src: &str) -> Expr {
    let program = parse(src).expect("expression should parse");
    assert_eq!(program.body.len(), 1);
    match program.body.into_iter().next() {
        Some(Stmt::Expr(e)) => e,
        other => panic!("expected expression statement, got {:?}", other),
    }
}

#[test]
fn test_operator_precedence() {
    let expr = single_expr("1 + 2 * 3");
    match expr {
        Expr::Binary { op, right, .. } => {
            assert_eq!(op, BinaryOp::Add);
            assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_power_is_right_associative_and_binds_tighter_than_unary() {
    let expr = single_expr("-2 ** 2");
    assert!(matches!(expr, Expr::Unary { .. }));
}

#[test]
fn test_not_in_comparison() {
    match single_expr("'a' not in names") {
        Expr::Compare { ops, .. } => assert_eq!(ops, vec![CompareOp::NotIn]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_call_with_keyword_arguments() {
    match single_expr("relative_delta(days=2, months=1)") {
        Expr::Call { args, kwargs, .. } => {
            assert!(args.is_empty());
            assert_eq!(kwargs.len(), 2);
            assert_eq!(kwargs[0].0, "days");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_adjacent_string_literals_concatenate() {
    match single_expr("'UC-' \"1\"") {
        Expr::Constant(Constant::Str(s), _) => assert_eq!(s, "UC-1"),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_slice_subscript() {
    match single_expr("items[1:3]") {
        Expr::Subscript { index, .. } => assert!(matches!(*index, Expr::Slice { .. })),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_conditional_expression() {
    assert!(matches!(single_expr("1 if flag else 2"), Expr::IfExp { .. }));
}

#[test]
fn test_collection_displays() {
    assert!(matches!(single_expr("[1, 2, 3,]"), Expr::List(items, _) if items.len() == 3));
    assert!(matches!(single_expr("(1,)"), Expr::Tuple(items, _) if items.len() == 1));
    assert!(matches!(single_expr("{1, 2}"), Expr::Set(items, _) if items.len() == 2));
    assert!(matches!(single_expr("{'a': 1}"), Expr::Dict(entries, _) if entries.len() == 1));
    assert!(matches!(single_expr("{}"), Expr::Dict(entries, _) if entries.is_empty()));
}

#[test]
fn test_statements_and_blocks() {
    let src = "\
total = 0
for x in [1, 2, 3]:
    if x == 2:
        break
    elif x > 5:
        pass
    else:
        total += x
total";
    let program = parse(src).unwrap();
    assert_eq!(program.body.len(), 3);
    assert!(matches!(program.body[0], Stmt::Assign { .. }));
    match &program.body[1] {
        Stmt::For { target, body, .. } => {
            assert_eq!(target, "x");
            assert_eq!(body.len(), 1);
            match &body[0] {
                Stmt::If { orelse, .. } => assert!(matches!(orelse[0], Stmt::If { .. })),
                other => panic!("unexpected {:?}", other),
            }
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_function_definition_with_defaults() {
    let src = "def fee(amount, rate=0.01):\n    return amount * rate\nfee(100)";
    let program = parse(src).unwrap();
    match &program.body[0] {
        Stmt::FunctionDef(def) => {
            assert_eq!(def.name, "fee");
            assert_eq!(def.params.len(), 2);
            assert!(def.params[1].default.is_some());
            assert!(matches!(def.body[0], Stmt::Return { value: Some(_), .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_try_except_finally() {
    let src = "try:\n    x = 1 / 0\nexcept ZeroDivisionError as e:\n    x = 0\nelse:\n    x = 2\nfinally:\n    y = 3";
    let program = parse(src).unwrap();
    match &program.body[0] {
        Stmt::Try {
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            assert_eq!(handlers.len(), 1);
            assert_eq!(handlers[0].kind.as_deref(), Some("ZeroDivisionError"));
            assert_eq!(handlers[0].alias.as_deref(), Some("e"));
            assert_eq!(orelse.len(), 1);
            assert_eq!(finalbody.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_semicolon_separated_statements() {
    let program = parse("a = 1; b = 2; a + b").unwrap();
    assert_eq!(program.body.len(), 3);
}

#[test]
fn test_inline_block() {
    let program = parse("while true: pass").unwrap();
    assert!(matches!(program.body[0], Stmt::While { .. }));
}

#[test]
fn test_chained_assignment_and_subscript_target() {
    let program = parse("a = b = 1\nd['k'] = a\nd.k = 2").unwrap();
    match &program.body[0] {
        Stmt::Assign { targets, .. } => assert_eq!(targets.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(&program.body[1], Stmt::Assign { targets, .. } if matches!(targets[0], Expr::Subscript { .. })));
    assert!(matches!(&program.body[2], Stmt::Assign { targets, .. } if matches!(targets[0], Expr::Attribute { .. })));
}

#[test]
fn test_empty_source_is_empty_program() {
    assert!(parse("").unwrap().body.is_empty());
    assert!(parse("  # just a comment\n").unwrap().body.is_empty());
}

#[test]
fn test_leading_indent_on_first_line_is_accepted() {
    assert!(parse("   amount > 0").is_ok());
}

#[test]
fn test_deep_nesting_is_rejected() {
    let src = format!("{}1{}", "(".repeat(500), ")".repeat(500));
    let err = parse(&src).unwrap_err();
    assert!(err.to_string().contains("nested too deeply"));

    let src = format!("{}1{}", "(".repeat(40), ")".repeat(40));
    assert!(parse(&src).is_ok());
}
