//! Canonical field names and the source-schema aliases they are read from.

use serde_json::{Map, Value};

pub const ID: &str = "id";
pub const TITLE: &str = "title";
pub const AUTHORS: &str = "authors";
pub const PUBLISHER: &str = "publisher";
pub const ISBN: &str = "isbn";
pub const PROGRESS: &str = "progress";
pub const IS_FINISHED: &str = "isFinished";
pub const COVER: &str = "cover";
pub const BOOK_TYPE: &str = "type";
pub const TAGS: &str = "tags";
pub const LAST_READ: &str = "lastRead";
pub const LAST_UPDATED: &str = "lastUpdated";
pub const RETRIEVED_AT: &str = "retrievedAt";
pub const SOURCE_TAB: &str = "sourceTab";

/// Fields that count towards completeness scoring
pub const SCORED_FIELDS: [&str; 11] = [
    ID, TITLE, AUTHORS, PUBLISHER, ISBN, PROGRESS, COVER, BOOK_TYPE, TAGS, LAST_READ, LAST_UPDATED,
];

/// Keys accepted for a canonical field, in lookup order. The camelCase keys written by
/// `BookRecord::to_raw` are always included so normalized output reads back unchanged.
pub fn aliases(field: &str) -> &'static [&'static str] {
    match field {
        ID => &["id", "bookId", "sourceId"],
        TITLE => &["title", "name", "bookTitle"],
        AUTHORS => &["authors", "author", "writer"],
        PUBLISHER => &["publisher"],
        ISBN => &["isbn", "ISBN", "isbn13"],
        PROGRESS => &["progress", "readingProgress", "percent"],
        IS_FINISHED => &["isFinished", "finished", "is_finished"],
        COVER => &["coverUrl", "cover", "cover_url", "image"],
        BOOK_TYPE => &["bookType", "type"],
        TAGS => &["tags"],
        LAST_READ => &["lastRead", "last_read", "lastReadAt"],
        LAST_UPDATED => &["lastUpdated", "updatedAt", "last_updated"],
        RETRIEVED_AT => &["retrievedAt", "extractedAt"],
        SOURCE_TAB => &["sourceTab", "tabId"],
        _ => &[],
    }
}

/// First non-null value stored under any alias of `field`
pub fn lookup<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let keys = aliases(field);
    if keys.is_empty() {
        return data.get(field).filter(|v| !v.is_null());
    }
    keys.iter().filter_map(|k| data.get(*k)).find(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_follows_alias_order_and_skips_nulls() {
        let value = json!({ "name": "Dune", "title": null, "bookTitle": "ignored" });
        let data = value.as_object().unwrap();
        assert_eq!(lookup(data, TITLE), Some(&json!("Dune")));
        assert_eq!(lookup(data, PUBLISHER), None);
    }
}
