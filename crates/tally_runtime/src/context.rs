use serde::{Deserialize, Serialize};
use tally_ir::{ComplexTransaction, TransactionType};

/// Who is running a transaction type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub user_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl RuntimeContext {
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            roles: vec!["admin".to_string()],
            permissions: vec!["*".to_string()],
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == "*" || p == permission)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::system()
    }
}

/// Decides whether a caller may book or rebook.
pub trait PermissionGate: Send + Sync {
    fn can_book(&self, tt: &TransactionType) -> bool;
    fn can_rebook(&self, header: &ComplexTransaction) -> bool;
}

/// `book` allows every type, `book:<user_code>` a single one; `rebook`
/// allows rebooking any header.
impl PermissionGate for RuntimeContext {
    fn can_book(&self, tt: &TransactionType) -> bool {
        self.has_permission("book") || self.has_permission(&format!("book:{}", tt.user_code))
    }

    fn can_rebook(&self, _header: &ComplexTransaction) -> bool {
        self.has_permission("rebook")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_book_permission() {
        let ctx = RuntimeContext {
            user_id: "ops".into(),
            roles: vec![],
            permissions: vec!["book:deposit".into()],
        };
        let deposit = TransactionType {
            user_code: "deposit".into(),
            ..Default::default()
        };
        let buy = TransactionType {
            user_code: "buy".into(),
            ..Default::default()
        };
        assert!(ctx.can_book(&deposit));
        assert!(!ctx.can_book(&buy));
        assert!(!ctx.can_rebook(&ComplexTransaction::default()));
        assert!(RuntimeContext::system().can_rebook(&ComplexTransaction::default()));
    }
}
