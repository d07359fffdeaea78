use serde_json::Value as Json;
use tally_ir::UniqueCodeOption;
use tracing::debug;

use super::{GeneralError, ProcessMode, Run};
use crate::errors::{PersistenceError, RuntimeError};
use crate::value::Value;

pub(super) enum UniqueCode {
    Assign(Option<String>),
    /// The code is held by this complex transaction, which should be rebooked instead.
    Overwrite(i64),
    /// The run ends here without a commit.
    Stop,
}

impl Run<'_> {
    /// Evaluates `transaction_unique_code_expr` and applies the type's
    /// collision policy against the stored headers.
    pub(super) async fn resolve_unique_code(&mut self) -> Result<UniqueCode, RuntimeError> {
        let tt = self.tt;
        let value = self
            .header_expr("transaction_unique_code_expr", &tt.transaction_unique_code_expr)
            .await?;
        let code = match value {
            None | Some(Value::None) => return Ok(UniqueCode::Assign(None)),
            Some(Value::Str(s)) => s.trim().to_string(),
            Some(other) => other.py_str(),
        };
        if code.is_empty() {
            return Ok(UniqueCode::Assign(None));
        }
        self.unique_base = Some(code.clone());

        let Some(holder) = self.holder_of(&code).await? else {
            return Ok(UniqueCode::Assign(Some(code)));
        };
        debug!(code, holder, option = ?tt.transaction_unique_code_options, "unique code collision");
        match tt.transaction_unique_code_options {
            UniqueCodeOption::Overwrite if self.mode == ProcessMode::Book => Ok(UniqueCode::Overwrite(holder)),
            UniqueCodeOption::Error | UniqueCodeOption::Overwrite => {
                self.conflict(code);
                Ok(UniqueCode::Stop)
            }
            UniqueCodeOption::AppendNumber => match self.append_number(&code).await? {
                Some(numbered) => {
                    self.log.record(format!("unique code '{}' taken, using '{}'", code, numbered));
                    Ok(UniqueCode::Assign(Some(numbered)))
                }
                None => {
                    self.conflict(code);
                    Ok(UniqueCode::Stop)
                }
            },
            UniqueCodeOption::Skip => {
                self.log.record(format!("unique code '{}' taken, booking skipped", code));
                self.result.general_errors.push(GeneralError::with_reason(
                    410,
                    format!("transaction_unique_code '{}' already exists, booking skipped", code),
                ));
                Ok(UniqueCode::Stop)
            }
            UniqueCodeOption::BookWithoutUniqueCode => {
                self.log.record(format!("unique code '{}' taken, booking without one", code));
                Ok(UniqueCode::Assign(None))
            }
        }
    }

    /// First free `<base>-<n>` with n starting at 2.
    pub(super) async fn append_number(&self, base: &str) -> Result<Option<String>, RuntimeError> {
        let attempts = self.config().append_number_attempts;
        for n in 2..2 + attempts {
            let candidate = format!("{}-{}", base, n);
            if self.holder_of(&candidate).await?.is_none() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Code of another stored header already using `unique_code`.
    async fn holder_of(&self, unique_code: &str) -> Result<Option<i64>, RuntimeError> {
        let found = self.session.store().find_by_unique_code(unique_code).await?;
        Ok(found
            .filter(|header| header.get("id").and_then(Json::as_str) != Some(self.header.id.as_str()))
            .map(|header| header.get("code").and_then(Json::as_i64).unwrap_or_default()))
    }

    fn conflict(&mut self, code: String) {
        let err = PersistenceError::Conflict {
            key: "transaction_unique_code".to_string(),
            value: code,
        };
        self.log.record(err.to_string());
        self.result.general_errors.push(GeneralError::with_reason(409, err.to_string()));
    }
}
