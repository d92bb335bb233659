use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::BookRecord;

const ID_HEX_LEN: usize = 16;

/// Stable identifier for the same logical book across platforms.
///
/// A well-formed ISBN wins: ISBN-10 is lifted to ISBN-13 first, so every edition listing
/// the same number converges on one id. Without one, the id falls back to a hash of
/// the normalized title and author list. That fallback misses retitled or retranslated
/// editions (a known false-negative), which is why the prefix (`isbn:` / `ta:`) is
/// kept in the id so callers can tell how strong a match is. A record with neither a
/// title nor authors has nothing to match on and is only identified by where it came
/// from (`src:`).
pub fn cross_platform_id(record: &BookRecord) -> String {
    if let Some(isbn13) = record.isbn.as_deref().and_then(to_isbn13) {
        return format!("isbn:{}", short_hash(&format!("isbn13:{}", isbn13)));
    }
    if record.title.trim().is_empty() && record.authors.iter().all(|a| a.trim().is_empty()) {
        return format!(
            "src:{}",
            short_hash(&format!("{}|{}", record.platform.as_str(), record.source_id))
        );
    }

    let title = record.title.to_lowercase();
    let authors = record
        .authors
        .iter()
        .map(|a| a.to_lowercase())
        .collect::<Vec<_>>()
        .join(";");
    format!("ta:{}", short_hash(&format!("{}|{}", title, authors)))
}

/// Fields that take part in the content fingerprint. Transient extraction metadata
/// (`retrieved_at`, `source_tab`) and derived identity fields are left out.
#[derive(Serialize)]
struct CanonicalFields<'a> {
    source_id: &'a str,
    platform: &'a str,
    title: &'a str,
    authors: &'a [String],
    publisher: Option<&'a str>,
    isbn: Option<&'a str>,
    progress: Option<f64>,
    is_finished: bool,
    cover_url: Option<&'a str>,
    book_type: Option<&'a str>,
    tags: &'a [String],
    last_read: Option<String>,
    last_updated: Option<String>,
}

/// Deterministic SHA-256 over the canonical field tuple
pub fn fingerprint(record: &BookRecord) -> String {
    let canonical = CanonicalFields {
        source_id: &record.source_id,
        platform: record.platform.as_str(),
        title: &record.title,
        authors: &record.authors,
        publisher: record.publisher.as_deref(),
        isbn: record.isbn.as_deref(),
        progress: record.progress,
        is_finished: record.is_finished,
        cover_url: record.cover_url.as_deref(),
        book_type: record.book_type.as_deref(),
        tags: &record.tags,
        last_read: record.last_read.map(|d| d.to_string()),
        last_updated: record.last_updated.map(|t| t.to_rfc3339()),
    };
    // Serializing a plain struct of strings, numbers and lists cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Fill in `cross_platform_id` and `fingerprint`
pub fn attach_identity(mut record: BookRecord) -> BookRecord {
    record.cross_platform_id = cross_platform_id(&record);
    record.fingerprint = fingerprint(&record);
    record
}

/// Canonical ISBN-13 digits when `isbn` has the shape of an ISBN-10 or ISBN-13.
/// The check digit is not verified here; that is a validation concern.
pub fn to_isbn13(isbn: &str) -> Option<String> {
    let bytes = isbn.as_bytes();
    match bytes.len() {
        13 if bytes.iter().all(u8::is_ascii_digit)
            && (isbn.starts_with("978") || isbn.starts_with("979")) =>
        {
            Some(isbn.to_string())
        }
        10 if bytes[..9].iter().all(u8::is_ascii_digit)
            && (bytes[9].is_ascii_digit() || bytes[9] == b'X') =>
        {
            let body = format!("978{}", &isbn[..9]);
            let check = isbn13_check_digit(&body)?;
            Some(format!("{}{}", body, check))
        }
        _ => None,
    }
}

/// True when `isbn` is an ISBN-10 or ISBN-13 whose check digit matches
pub fn has_valid_checksum(isbn: &str) -> bool {
    let bytes = isbn.as_bytes();
    match bytes.len() {
        13 if bytes.iter().all(u8::is_ascii_digit) => {
            isbn13_check_digit(&isbn[..12]).map(|d| d == bytes[12] - b'0').unwrap_or(false)
        }
        10 if bytes[..9].iter().all(u8::is_ascii_digit) => {
            let sum: u32 = bytes[..9]
                .iter()
                .enumerate()
                .map(|(i, b)| (10 - i as u32) * u32::from(b - b'0'))
                .sum();
            let last = match bytes[9] {
                b'X' => 10,
                b if b.is_ascii_digit() => u32::from(b - b'0'),
                _ => return false,
            };
            (sum + last) % 11 == 0
        }
        _ => false,
    }
}

fn isbn13_check_digit(first_twelve: &str) -> Option<u8> {
    if first_twelve.len() != 12 {
        return None;
    }
    let mut sum = 0u32;
    for (i, c) in first_twelve.chars().enumerate() {
        let d = c.to_digit(10)?;
        sum += if i % 2 == 0 { d } else { d * 3 };
    }
    Some(((10 - sum % 10) % 10) as u8)
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(ID_HEX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;
    use chrono::{TimeZone, Utc};

    fn book(platform: Platform, source_id: &str) -> BookRecord {
        let mut record = BookRecord::blank(platform);
        record.source_id = source_id.to_string();
        record.title = "Kitchen".to_string();
        record.authors = vec!["Banana Yoshimoto".to_string()];
        record
    }

    #[test]
    fn test_same_isbn_on_two_platforms_shares_an_id() {
        let mut a = book(Platform::Readmoo, "A");
        a.isbn = Some("9781234567890".to_string());
        let mut b = book(Platform::Kobo, "B");
        b.isbn = Some("9781234567890".to_string());
        b.title = "Kitchen (Deluxe Edition)".to_string();

        assert_eq!(cross_platform_id(&a), cross_platform_id(&b));
        assert!(cross_platform_id(&a).starts_with("isbn:"));
    }

    #[test]
    fn test_isbn10_and_isbn13_converge() {
        let mut a = book(Platform::Kindle, "A");
        a.isbn = Some("0553380958".to_string());
        let mut b = book(Platform::Kobo, "B");
        b.isbn = Some("9780553380958".to_string());
        assert_eq!(cross_platform_id(&a), cross_platform_id(&b));
    }

    #[test]
    fn test_fallback_id_uses_title_and_authors() {
        let a = book(Platform::Kindle, "A");
        let mut b = book(Platform::Kobo, "B");
        assert_eq!(cross_platform_id(&a), cross_platform_id(&b));
        assert!(cross_platform_id(&a).starts_with("ta:"));

        b.isbn = Some("not-an-isbn".to_string());
        assert_eq!(cross_platform_id(&a), cross_platform_id(&b));

        b.title = "Kitchen: A Novel".to_string();
        assert_ne!(cross_platform_id(&a), cross_platform_id(&b));
    }

    #[test]
    fn test_untitled_records_are_identified_by_source() {
        let mut a = BookRecord::blank(Platform::Kobo);
        a.source_id = "x1".to_string();
        let mut b = a.clone();
        b.source_id = "x2".to_string();

        assert_ne!(cross_platform_id(&a), cross_platform_id(&b));
        assert!(cross_platform_id(&a).starts_with("src:"));
        assert_eq!(cross_platform_id(&a), cross_platform_id(&a.clone()));

        let mut elsewhere = a.clone();
        elsewhere.platform = Platform::Kindle;
        assert_ne!(cross_platform_id(&a), cross_platform_id(&elsewhere));

        // A title alone is enough to fall back to title/author matching
        a.title = "Untitled Draft".to_string();
        assert!(cross_platform_id(&a).starts_with("ta:"));
    }

    #[test]
    fn test_fingerprint_ignores_transient_fields() {
        let a = book(Platform::Readmoo, "A");
        let mut b = a.clone();
        b.retrieved_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        b.source_tab = Some("tab-9".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), fingerprint(&a));
    }

    #[test]
    fn test_fingerprint_changes_with_canonical_fields() {
        let base = book(Platform::Readmoo, "A");
        let mut changed = base.clone();
        changed.progress = Some(10.0);
        assert_ne!(fingerprint(&base), fingerprint(&changed));

        let mut changed = base.clone();
        changed.tags.push("jp".to_string());
        assert_ne!(fingerprint(&base), fingerprint(&changed));

        let mut changed = base.clone();
        changed.is_finished = true;
        assert_ne!(fingerprint(&base), fingerprint(&changed));
    }

    #[test]
    fn test_checksum_validation() {
        assert!(has_valid_checksum("9780553380958"));
        assert!(has_valid_checksum("0553380958"));
        assert!(has_valid_checksum("080442957X"));
        assert!(!has_valid_checksum("9781234567890"));
        assert!(!has_valid_checksum("abc"));
    }
}
