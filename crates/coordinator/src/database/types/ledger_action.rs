use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};

use common::message::MountAction;

/// Last requested action for a ledger row (stored as TEXT).
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerAction {
    Mount,
    Unmount,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Unmount => "unmount",
        }
    }
}

impl From<MountAction> for LedgerAction {
    fn from(action: MountAction) -> Self {
        match action {
            MountAction::Mount => Self::Mount,
            MountAction::Unmount => Self::Unmount,
        }
    }
}

impl std::fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Decode<'_, Sqlite> for LedgerAction {
    fn decode(value: SqliteValueRef<'_>) -> Result<Self, BoxDynError> {
        let text = <&str as Decode<Sqlite>>::decode(value)?;
        match text {
            "mount" => Ok(Self::Mount),
            "unmount" => Ok(Self::Unmount),
            other => Err(format!("unknown ledger action: {other}").into()),
        }
    }
}

impl Encode<'_, Sqlite> for LedgerAction {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'_>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Text(self.as_str().into()));
        Ok(IsNull::No)
    }
}

impl Type<Sqlite> for LedgerAction {
    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <&str as Type<Sqlite>>::compatible(ty)
    }

    fn type_info() -> SqliteTypeInfo {
        <&str as Type<Sqlite>>::type_info()
    }
}
