use bytes::BytesMut;
use std::error::Error;
use std::fmt;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

/// Routing tag for the two upstream processors. Persisted verbatim in the
/// `service_used` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    Default,
    Fallback,
}

impl ProcessorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::Default => "default",
            ProcessorKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ProcessorKind {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.as_str().to_sql(ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <&str as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for ProcessorKind {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        match <&str as FromSql>::from_sql(ty, raw)? {
            "default" => Ok(ProcessorKind::Default),
            "fallback" => Ok(ProcessorKind::Fallback),
            other => Err(format!("unknown service_used value: {}", other).into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <&str as FromSql>::accepts(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_column_values() {
        assert_eq!(ProcessorKind::Default.to_string(), "default");
        assert_eq!(ProcessorKind::Fallback.to_string(), "fallback");
    }

    #[test]
    fn decodes_text_column() {
        let kind = ProcessorKind::from_sql(&Type::TEXT, b"fallback").unwrap();
        assert_eq!(kind, ProcessorKind::Fallback);
        assert!(ProcessorKind::from_sql(&Type::TEXT, b"cash").is_err());
    }
}
