use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

/// Price value - uses Decimal for precision
pub type Price = Decimal;

/// Volume value - uses Decimal for precision
pub type Volume = Decimal;

/// Timestamp in UTC
pub type Timestamp = DateTime<Utc>;

/// Symbol identifier for a tradeable instrument (e.g. "EURUSD")
pub type Symbol = String;

/// Terminal ids (tickets) arrive either as JSON numbers or strings.
/// Both are normalized to their decimal string form.
pub fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Unsigned(value) => value.to_string(),
        RawId::Signed(value) => value.to_string(),
    })
}

/// Optional variant of [`id_from_string_or_number`].
pub fn optional_id_from_string_or_number<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "id_from_string_or_number")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}

/// Vector variant of [`id_from_string_or_number`], used for removed / completed id lists.
pub fn ids_from_strings_or_numbers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "id_from_string_or_number")] String);

    Ok(Vec::<Wrapper>::deserialize(deserializer)?
        .into_iter()
        .map(|Wrapper(id)| id)
        .collect())
}
