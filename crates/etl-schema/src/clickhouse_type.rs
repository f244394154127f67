/// The closed set of ClickHouse column types the sink mapping may declare
/// (spec.md §3), parsed from the wire-format string used in the pipeline
/// definition's `table_mapping[].column_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickHouseType {
    String,
    FixedString(u32),
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    DateTime,
    DateTime64(u32),
    Uuid,
    Enum8(Vec<(String, i8)>),
    Enum16(Vec<(String, i16)>),
    LowCardinality(Box<ClickHouseType>),
}

impl ClickHouseType {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if let Some(inner) = strip_wrapper(s, "LowCardinality") {
            return Ok(ClickHouseType::LowCardinality(Box::new(Self::parse(inner)?)));
        }
        if let Some(inner) = strip_wrapper(s, "FixedString") {
            let n: u32 = inner.trim().parse().map_err(|_| format!("bad FixedString size: {inner}"))?;
            return Ok(ClickHouseType::FixedString(n));
        }
        if let Some(inner) = strip_wrapper(s, "DateTime64") {
            let precision: u32 = inner
                .split(',')
                .next()
                .unwrap_or("")
                .trim()
                .parse()
                .map_err(|_| format!("bad DateTime64 precision: {inner}"))?;
            return Ok(ClickHouseType::DateTime64(precision));
        }
        if let Some(inner) = strip_wrapper(s, "Enum8") {
            return Ok(ClickHouseType::Enum8(parse_enum_variants(inner)?));
        }
        if let Some(inner) = strip_wrapper(s, "Enum16") {
            return Ok(ClickHouseType::Enum16(parse_enum_variants_wide(inner)?));
        }
        match s {
            "String" => Ok(ClickHouseType::String),
            "Bool" => Ok(ClickHouseType::Bool),
            "Int8" => Ok(ClickHouseType::Int8),
            "Int16" => Ok(ClickHouseType::Int16),
            "Int32" => Ok(ClickHouseType::Int32),
            "Int64" => Ok(ClickHouseType::Int64),
            "UInt8" => Ok(ClickHouseType::UInt8),
            "UInt16" => Ok(ClickHouseType::UInt16),
            "UInt32" => Ok(ClickHouseType::UInt32),
            "UInt64" => Ok(ClickHouseType::UInt64),
            "Float32" => Ok(ClickHouseType::Float32),
            "Float64" => Ok(ClickHouseType::Float64),
            "DateTime" => Ok(ClickHouseType::DateTime),
            "UUID" => Ok(ClickHouseType::Uuid),
            other => Err(format!("unsupported ClickHouse type: {other}")),
        }
    }

    /// The type name as it would appear in `CREATE TABLE`/`DESC TABLE`,
    /// used to validate the mapping and to render migration DDL.
    pub fn name(&self) -> String {
        match self {
            ClickHouseType::String => "String".into(),
            ClickHouseType::FixedString(n) => format!("FixedString({n})"),
            ClickHouseType::Bool => "Bool".into(),
            ClickHouseType::Int8 => "Int8".into(),
            ClickHouseType::Int16 => "Int16".into(),
            ClickHouseType::Int32 => "Int32".into(),
            ClickHouseType::Int64 => "Int64".into(),
            ClickHouseType::UInt8 => "UInt8".into(),
            ClickHouseType::UInt16 => "UInt16".into(),
            ClickHouseType::UInt32 => "UInt32".into(),
            ClickHouseType::UInt64 => "UInt64".into(),
            ClickHouseType::Float32 => "Float32".into(),
            ClickHouseType::Float64 => "Float64".into(),
            ClickHouseType::DateTime => "DateTime".into(),
            ClickHouseType::DateTime64(p) => format!("DateTime64({p})"),
            ClickHouseType::Uuid => "UUID".into(),
            ClickHouseType::Enum8(vs) => format!("Enum8({})", render_variants(vs)),
            ClickHouseType::Enum16(vs) => format!("Enum16({})", render_variants(vs)),
            ClickHouseType::LowCardinality(inner) => format!("LowCardinality({})", inner.name()),
        }
    }

    /// Unwraps `LowCardinality(...)` to the underlying type, since the
    /// compatibility matrix (spec.md §4.1) treats `LowCardinality(String)`
    /// and `String` identically once a value has been coerced.
    pub fn underlying(&self) -> &ClickHouseType {
        match self {
            ClickHouseType::LowCardinality(inner) => inner.underlying(),
            other => other,
        }
    }
}

fn strip_wrapper<'a>(s: &'a str, wrapper: &str) -> Option<&'a str> {
    let prefix = format!("{wrapper}(");
    if s.starts_with(&prefix) && s.ends_with(')') {
        Some(&s[prefix.len()..s.len() - 1])
    } else {
        None
    }
}

fn parse_enum_variants(inner: &str) -> Result<Vec<(String, i8)>, String> {
    parse_variants(inner)?
        .into_iter()
        .map(|(name, v)| Ok((name, i8::try_from(v).map_err(|_| format!("Enum8 value out of range: {v}"))?)))
        .collect()
}

fn parse_enum_variants_wide(inner: &str) -> Result<Vec<(String, i16)>, String> {
    parse_variants(inner)?
        .into_iter()
        .map(|(name, v)| Ok((name, i16::try_from(v).map_err(|_| format!("Enum16 value out of range: {v}"))?)))
        .collect()
}

fn parse_variants(inner: &str) -> Result<Vec<(String, i64)>, String> {
    inner
        .split(',')
        .map(|pair| {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("bad enum variant: {pair}"))?;
            let name = name.trim().trim_matches('\'').to_string();
            let value: i64 = value.trim().parse().map_err(|_| format!("bad enum value: {value}"))?;
            Ok((name, value))
        })
        .collect()
}

fn render_variants<T: std::fmt::Display>(vs: &[(String, T)]) -> String {
    vs.iter()
        .map(|(name, v)| format!("'{name}' = {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_low_cardinality_string() {
        let t = ClickHouseType::parse("LowCardinality(String)").unwrap();
        assert_eq!(*t.underlying(), ClickHouseType::String);
    }

    #[test]
    fn parses_fixed_string() {
        assert_eq!(ClickHouseType::parse("FixedString(16)").unwrap(), ClickHouseType::FixedString(16));
    }

    #[test]
    fn parses_datetime64() {
        assert_eq!(ClickHouseType::parse("DateTime64(3)").unwrap(), ClickHouseType::DateTime64(3));
    }

    #[test]
    fn parses_enum8() {
        let t = ClickHouseType::parse("Enum8('a' = 1, 'b' = 2)").unwrap();
        assert_eq!(t, ClickHouseType::Enum8(vec![("a".into(), 1), ("b".into(), 2)]));
    }
}
