use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReconcileError;

/// Raw book data exactly as extracted from a reading platform page
pub type RawRecord = serde_json::Value;

/// Reading platforms the extractor knows how to scrape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Readmoo,
    Kindle,
    Kobo,
    BooksCom,
    Bookwalker,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Readmoo,
        Platform::Kindle,
        Platform::Kobo,
        Platform::BooksCom,
        Platform::Bookwalker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Readmoo => "readmoo",
            Platform::Kindle => "kindle",
            Platform::Kobo => "kobo",
            Platform::BooksCom => "books_com",
            Platform::Bookwalker => "bookwalker",
        }
    }

    /// Base used to resolve root-relative cover paths
    pub fn base_url(&self) -> &'static str {
        match self {
            Platform::Readmoo => "https://readmoo.com",
            Platform::Kindle => "https://read.amazon.com",
            Platform::Kobo => "https://www.kobo.com",
            Platform::BooksCom => "https://www.books.com.tw",
            Platform::Bookwalker => "https://www.bookwalker.com.tw",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['-', '.'], "_");
        match key.as_str() {
            "readmoo" => Ok(Platform::Readmoo),
            "kindle" => Ok(Platform::Kindle),
            "kobo" => Ok(Platform::Kobo),
            "books_com" | "bookscom" | "books_com_tw" => Ok(Platform::BooksCom),
            "bookwalker" => Ok(Platform::Bookwalker),
            _ => Err(ReconcileError::UnknownPlatform(s.to_string())),
        }
    }
}

/// A book record in canonical form.
///
/// `cross_platform_id` and `fingerprint` are empty straight out of the normalizer and
/// are filled in by [`crate::pipeline::processing::identity::attach_identity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    pub source_id: String,
    pub platform: Platform,
    pub title: String,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub isbn: Option<String>,
    pub progress: Option<f64>,
    pub is_finished: bool,
    pub cover_url: Option<String>,
    pub book_type: Option<String>,
    pub tags: Vec<String>,
    pub last_read: Option<NaiveDate>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Transient: when the extractor scraped this record
    pub retrieved_at: Option<DateTime<Utc>>,
    /// Transient: which browser tab the record came from
    pub source_tab: Option<String>,
    pub cross_platform_id: String,
    pub fingerprint: String,
}

impl BookRecord {
    /// An empty record for `platform`, used as the normalizer's starting point
    pub fn blank(platform: Platform) -> Self {
        Self {
            source_id: String::new(),
            platform,
            title: String::new(),
            authors: Vec::new(),
            publisher: None,
            isbn: None,
            progress: None,
            is_finished: false,
            cover_url: None,
            book_type: None,
            tags: Vec::new(),
            last_read: None,
            last_updated: None,
            retrieved_at: None,
            source_tab: None,
            cross_platform_id: String::new(),
            fingerprint: String::new(),
        }
    }

    /// Serialize back into the raw shape so the record can be re-normalized or stored
    pub fn to_raw(&self) -> RawRecord {
        serde_json::to_value(self).unwrap_or(RawRecord::Null)
    }

    /// Identifier used in reports: the cross-platform id when known, else the source id
    pub fn record_id(&self) -> &str {
        if self.cross_platform_id.is_empty() {
            &self.source_id
        } else {
            &self.cross_platform_id
        }
    }

    /// Short human label for progress displays
    pub fn display_label(&self) -> String {
        if self.title.is_empty() {
            self.source_id.clone()
        } else {
            self.title.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parses_common_spellings() {
        assert_eq!("Readmoo".parse::<Platform>().unwrap(), Platform::Readmoo);
        assert_eq!("books.com".parse::<Platform>().unwrap(), Platform::BooksCom);
        assert_eq!("books-com-tw".parse::<Platform>().unwrap(), Platform::BooksCom);
        assert!("".parse::<Platform>().is_err());
        assert!("nook".parse::<Platform>().is_err());
    }

    #[test]
    fn test_record_serializes_with_camel_case_keys() {
        let mut record = BookRecord::blank(Platform::Kobo);
        record.source_id = "k-1".to_string();
        record.is_finished = true;

        let raw = record.to_raw();
        assert_eq!(raw["sourceId"], "k-1");
        assert_eq!(raw["isFinished"], true);
        assert_eq!(raw["platform"], "kobo");
    }
}
