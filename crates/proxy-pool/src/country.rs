//! Country inference from phone numbers
//!
//! Used to prefer a proxy in the same country as the credential's phone.

/// Calling-code prefix → ISO 3166-1 alpha-2.
const PHONE_PREFIXES: &[(&str, &str)] = &[
    ("7", "RU"),
    ("77", "KZ"),
    ("380", "UA"),
    ("375", "BY"),
    ("1", "US"),
    ("44", "GB"),
    ("49", "DE"),
    ("33", "FR"),
    ("39", "IT"),
    ("34", "ES"),
    ("31", "NL"),
    ("48", "PL"),
    ("420", "CZ"),
    ("43", "AT"),
    ("41", "CH"),
    ("46", "SE"),
    ("47", "NO"),
    ("45", "DK"),
    ("358", "FI"),
    ("32", "BE"),
    ("351", "PT"),
    ("90", "TR"),
    ("81", "JP"),
    ("82", "KR"),
    ("86", "CN"),
    ("852", "HK"),
    ("65", "SG"),
    ("61", "AU"),
    ("55", "BR"),
    ("91", "IN"),
    ("972", "IL"),
    ("971", "AE"),
    ("370", "LT"),
    ("371", "LV"),
    ("372", "EE"),
    ("373", "MD"),
    ("374", "AM"),
    ("994", "AZ"),
    ("995", "GE"),
];

/// Country of a phone number by its longest known calling-code prefix.
///
/// Accepts `+`, spaces and dashes in the input.
pub fn country_for_phone(phone: &str) -> Option<&'static str> {
    let digits: String = phone
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-'))
        .collect();
    if digits.is_empty() {
        return None;
    }
    PHONE_PREFIXES
        .iter()
        .filter(|(prefix, _)| digits.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, country)| *country)
}
