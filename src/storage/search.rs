//! Search engine: composable filters over logbook subtrees with priority
//! inheritance, followup aggregation, and pagination.
//!
//! The query is assembled as raw SQL because subtree scoping needs a
//! recursive CTE and the dynamic shapes live in JSON1 columns. A result
//! row is a *thread*, grouped by `coalesce(follows_id, id)`: it carries
//! the root entry, the followup count, the latest timestamp anywhere in
//! the thread, and the union of followup author sets. When a text filter
//! is active, followups that match are returned as standalone rows
//! instead of being collapsed into their root.

use jiff::Timestamp;
use rusqlite::types::Value as SqlValue;

use crate::model::{Author, Entry, PRIORITY_PINNED};

use super::entry::decode_entry;
use super::{encode_ts, json_column, ts_column, Result, Storage};

/// Search inputs. All filters are optional; an empty query lists every
/// entry in scope, newest first.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Scope root. Absent means a global search over all logbooks.
    pub logbook: Option<i64>,
    /// Include entries of descendant logbooks (and important entries of
    /// ancestors).
    pub child_logbooks: bool,
    /// Include archived entries.
    pub archived: bool,
    /// Match followup entries individually even without a text filter.
    pub followups: bool,
    pub title_filter: Option<String>,
    pub content_filter: Option<String>,
    pub author_filter: Option<String>,
    pub attachment_filter: Option<String>,
    /// (name, value) pairs; substring match on the JSON-encoded attribute
    /// value, so a multioption array matches any of its elements.
    pub attribute_filters: Vec<(String, String)>,
    /// (name, value) pairs; LIKE match on the metadata value.
    pub metadata_filters: Vec<(String, String)>,
    /// Lower bound on the thread-latest timestamp.
    pub from_timestamp: Option<Timestamp>,
    /// Upper bound on the thread-latest timestamp.
    pub until_timestamp: Option<Timestamp>,
    /// Order by the thread-latest timestamp (default); otherwise by
    /// creation time.
    pub sort_by_timestamp: bool,
    pub n: Option<u32>,
    pub offset: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            logbook: None,
            child_logbooks: false,
            archived: false,
            followups: false,
            title_filter: None,
            content_filter: None,
            author_filter: None,
            attachment_filter: None,
            attribute_filters: Vec::new(),
            metadata_filters: Vec::new(),
            from_timestamp: None,
            until_timestamp: None,
            sort_by_timestamp: true,
            n: None,
            offset: 0,
        }
    }
}

impl SearchQuery {
    /// Whether any text filter is active. Text-filtered searches return
    /// matching followups as standalone rows.
    fn text_filtered(&self) -> bool {
        self.title_filter.is_some()
            || self.content_filter.is_some()
            || self.author_filter.is_some()
            || self.attachment_filter.is_some()
            || !self.metadata_filters.is_empty()
    }
}

/// One thread row of a search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: Entry,
    /// Id of the thread root (the entry itself unless it is a followup
    /// matched by a text filter).
    pub thread_id: i64,
    pub n_followups: u32,
    /// Latest of `(last_changed_at, created_at)` across the root and its
    /// non-archived followups.
    pub timestamp: Timestamp,
    /// Union of the author sets of all followups, for list rendering.
    pub followup_authors: Vec<Author>,
}

impl Storage {
    /// Runs a search, returning thread rows ordered by
    /// `priority DESC, timestamp DESC, id DESC` and paginated after
    /// ordering.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let (sql, params) = build_query(query, false);
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), decode_hit)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The total number of threads the search would return, ignoring
    /// pagination.
    pub fn search_count(&self, query: &SearchQuery) -> Result<u64> {
        let (sql, params) = build_query(query, true);
        let conn = self.conn();
        let count: i64 =
            conn.query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn build_query(query: &SearchQuery, count: bool) -> (String, Vec<SqlValue>) {
    let mut params: Vec<SqlValue> = Vec::new();
    let mut sql = String::new();

    // Scope: recursive subtree expansion stops at archived logbooks, and
    // important entries bubble down from (non-archived) ancestors.
    let scope = match (query.logbook, query.child_logbooks) {
        (Some(logbook), true) => {
            sql.push_str(
                "WITH RECURSIVE descendant(id) AS (
                    VALUES(?)
                    UNION
                    SELECT logbook.id FROM logbook, descendant
                    WHERE logbook.parent_id = descendant.id AND NOT logbook.archived
                ), ancestor(id) AS (
                    SELECT parent_id FROM logbook WHERE id = ? AND parent_id IS NOT NULL
                    UNION
                    SELECT logbook.parent_id FROM logbook, ancestor
                    WHERE logbook.id = ancestor.id AND logbook.parent_id IS NOT NULL
                )\n",
            );
            params.push(SqlValue::Integer(logbook));
            params.push(SqlValue::Integer(logbook));
            format!(
                "(entry.logbook_id IN (SELECT id FROM descendant)
                  OR (entry.priority > {PRIORITY_PINNED} AND entry.logbook_id IN
                        (SELECT ancestor.id FROM ancestor
                         JOIN logbook ON logbook.id = ancestor.id
                         WHERE NOT logbook.archived)))"
            )
        }
        (Some(logbook), false) => {
            params.push(SqlValue::Integer(logbook));
            "entry.logbook_id = ?".to_string()
        }
        (None, _) => "entry.logbook_id IN (SELECT id FROM logbook WHERE NOT archived)".to_string(),
    };

    let followup_join = if query.archived {
        "LEFT JOIN entry AS followup ON followup.follows_id = entry.id"
    } else {
        "LEFT JOIN entry AS followup ON followup.follows_id = entry.id AND NOT followup.archived"
    };

    sql.push_str(
        "SELECT entry.id, entry.logbook_id, entry.title, entry.authors, entry.content,
                entry.content_type, entry.metadata, entry.attributes, entry.priority,
                entry.created_at, entry.last_changed_at, entry.follows_id, entry.archived,
                coalesce(entry.follows_id, entry.id) AS thread,
                count(followup.id) AS n_followups,
                max(coalesce(coalesce(followup.last_changed_at, followup.created_at),
                             coalesce(entry.last_changed_at, entry.created_at))) AS timestamp,
                json_group_array(json(ifnull(followup.authors, '[]'))) AS followup_authors
         FROM entry\n",
    );
    sql.push_str(followup_join);
    sql.push_str("\nWHERE ");
    sql.push_str(&scope);

    if !query.archived {
        sql.push_str(" AND NOT entry.archived");
    }
    if let Some(content) = &query.content_filter {
        sql.push_str(" AND entry.content IS NOT NULL AND entry.content REGEXP ?");
        params.push(SqlValue::Text(content.clone()));
    }
    if let Some(title) = &query.title_filter {
        sql.push_str(" AND entry.title IS NOT NULL AND entry.title REGEXP ?");
        params.push(SqlValue::Text(title.clone()));
    }
    if let Some(author) = &query.author_filter {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM json_each(entry.authors) AS author
                          WHERE json_extract(author.value, '$.name') REGEXP ?)",
        );
        params.push(SqlValue::Text(author.clone()));
    }
    if let Some(attachment) = &query.attachment_filter {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM attachment
                          WHERE attachment.entry_id = entry.id
                            AND NOT attachment.archived
                            AND attachment.path REGEXP ?)",
        );
        params.push(SqlValue::Text(attachment.clone()));
    }
    // Attribute values live in a JSON object column; a multioption array
    // matches when it contains the quoted value, a scalar when its text
    // form matches the (user-suppliable) LIKE pattern.
    for (name, value) in &query.attribute_filters {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM json_each(entry.attributes) AS attr
                          WHERE attr.key = ?
                            AND ((attr.type = 'array' AND attr.value LIKE '%\"' || ? || '\"%')
                                 OR attr.value LIKE ?))",
        );
        params.push(SqlValue::Text(name.clone()));
        params.push(SqlValue::Text(value.clone()));
        params.push(SqlValue::Text(value.clone()));
    }
    for (name, value) in &query.metadata_filters {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM json_each(entry.metadata) AS meta
                          WHERE meta.key = ? AND meta.value LIKE ?)",
        );
        params.push(SqlValue::Text(name.clone()));
        params.push(SqlValue::Text(value.clone()));
    }

    sql.push_str("\nGROUP BY entry.id");

    let mut having = Vec::new();
    if !query.followups && !query.text_filtered() {
        having.push("entry.follows_id IS NULL".to_string());
    }
    if let Some(from) = query.from_timestamp {
        having.push("timestamp >= ?".to_string());
        params.push(SqlValue::Text(encode_ts(from)));
    }
    if let Some(until) = query.until_timestamp {
        having.push("timestamp <= ?".to_string());
        params.push(SqlValue::Text(encode_ts(until)));
    }
    if !having.is_empty() {
        sql.push_str("\nHAVING ");
        sql.push_str(&having.join(" AND "));
    }

    if count {
        return (format!("SELECT count(*) FROM ({sql})"), params);
    }

    if query.sort_by_timestamp {
        sql.push_str("\nORDER BY entry.priority DESC, timestamp DESC, entry.id DESC");
    } else {
        sql.push_str("\nORDER BY entry.priority DESC, entry.created_at DESC, entry.id DESC");
    }
    if let Some(n) = query.n {
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(SqlValue::Integer(i64::from(n)));
        params.push(SqlValue::Integer(i64::from(query.offset)));
    }

    (sql, params)
}

fn decode_hit(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchHit> {
    let entry = decode_entry(row)?;
    let timestamp: String = row.get(15)?;
    let followup_authors: String = row.get(16)?;
    let n_followups: i64 = row.get(14)?;
    Ok(SearchHit {
        entry,
        thread_id: row.get(13)?,
        n_followups: u32::try_from(n_followups).unwrap_or(0),
        timestamp: ts_column(15, &timestamp)?,
        followup_authors: flatten_authors(json_column(16, &followup_authors)?),
    })
}

/// The SQL aggregates one author array per followup; flatten them into a
/// single ordered set.
fn flatten_authors(groups: Vec<Vec<Author>>) -> Vec<Author> {
    let mut authors: Vec<Author> = Vec::new();
    for author in groups.into_iter().flatten() {
        if !authors.contains(&author) {
            authors.push(author);
        }
    }
    authors
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::storage::{NewEntry, NewLogbook};

    use super::*;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn logbook(storage: &Storage, name: &str, parent: Option<i64>) -> i64 {
        storage
            .create_logbook(NewLogbook {
                name: name.into(),
                parent_id: parent,
                ..NewLogbook::default()
            })
            .unwrap()
            .id
    }

    fn entry(storage: &Storage, logbook_id: i64, title: &str, content: &str) -> i64 {
        storage
            .create_entry(NewEntry {
                title: Some(title.into()),
                content: Some(content.into()),
                ..NewEntry::in_logbook(logbook_id)
            })
            .unwrap()
            .id
    }

    fn titles(hits: &[SearchHit]) -> Vec<String> {
        hits.iter()
            .map(|h| h.entry.title.clone().unwrap_or_default())
            .collect()
    }

    fn seed_contents(storage: &Storage, lb: i64) {
        entry(storage, lb, "First entry", "This content is great!");
        entry(storage, lb, "Second entry", "Some very neat content.");
        entry(storage, lb, "Third entry", "Not so bad content either.");
    }

    #[test]
    fn content_filter_is_a_regex() {
        let storage = test_storage();
        let lb1 = logbook(&storage, "Logbook1", None);
        let lb2 = logbook(&storage, "Logbook2", None);
        seed_contents(&storage, lb1);
        entry(&storage, lb2, "Fourth entry", "Not so great content, ignored.");

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb1),
                content_filter: Some("great".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["First entry"]);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb1),
                content_filter: Some("Not.*content".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["Third entry"]);
    }

    #[test]
    fn global_search_spans_logbooks() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        seed_contents(&storage, lb);

        let hits = storage
            .search(&SearchQuery {
                content_filter: Some("great".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["First entry"]);
    }

    #[test]
    fn title_filter_is_a_regex() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        seed_contents(&storage, lb);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                title_filter: Some("Th.*ry".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["Third entry"]);
    }

    #[test]
    fn author_filter_matches_any_author() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        let alpha = Author {
            name: "alpha".into(),
            login: None,
            email: None,
        };
        let beta = Author {
            name: "beta".into(),
            login: None,
            email: None,
        };
        let gamma = Author {
            name: "gamma".into(),
            login: None,
            email: None,
        };
        for (title, authors) in [
            ("First entry", vec![alpha.clone(), beta.clone()]),
            ("Second entry", vec![alpha.clone()]),
            ("Third entry", vec![gamma, beta]),
        ] {
            storage
                .create_entry(NewEntry {
                    title: Some(title.into()),
                    authors,
                    ..NewEntry::in_logbook(lb)
                })
                .unwrap();
        }

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                author_filter: Some("alpha".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        let mut found = titles(&hits);
        found.sort();
        assert_eq!(found, vec!["First entry", "Second entry"]);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                author_filter: Some("alpha|beta".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn attribute_filter_matches_scalars_and_multioptions() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        for (title, attributes) in [
            ("First entry", json!({"a": ["1", "2", "3"]})),
            ("Second entry", json!({"a": ["2"], "b": ["7"]})),
            ("Third entry", json!({"a": ["3", "4"]})),
        ] {
            // Bypass spec validation: write raw attribute JSON the way an
            // older schema revision might have left it.
            storage.conn().execute(
                "INSERT INTO entry (logbook_id, title, authors, content_type, metadata,
                                    attributes, priority, created_at, archived)
                 VALUES (?1, ?2, '[]', 'text/html', '{}', ?3, 0, '2019-01-01 00:00:00.000000', 0)",
                rusqlite::params![lb, title, attributes.to_string()],
            )
            .unwrap();
        }

        let one = |filters: Vec<(&str, &str)>| {
            storage
                .search(&SearchQuery {
                    logbook: Some(lb),
                    attribute_filters: filters
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    ..SearchQuery::default()
                })
                .unwrap()
        };

        assert_eq!(titles(&one(vec![("a", "1")])), vec!["First entry"]);
        assert_eq!(one(vec![("a", "2")]).len(), 2);
        assert_eq!(titles(&one(vec![("a", "2"), ("a", "3")])), vec!["First entry"]);
        assert_eq!(titles(&one(vec![("a", "2"), ("b", "7")])), vec!["Second entry"]);
    }

    #[test]
    fn metadata_filter_supports_like_patterns() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        for (title, message) in [
            ("First entry", "hello"),
            ("Second entry", "yellow"),
            ("Third entry", "other"),
        ] {
            storage
                .create_entry(NewEntry {
                    title: Some(title.into()),
                    metadata: json!({"message": message}).as_object().cloned().unwrap(),
                    ..NewEntry::in_logbook(lb)
                })
                .unwrap();
        }

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                metadata_filters: vec![("message".into(), "hello".into())],
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["First entry"]);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                metadata_filters: vec![("message".into(), "%ello%".into())],
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn threads_collapse_to_roots_without_text_filters() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        let root = entry(&storage, lb, "First entry", "This content is great!");
        let mid = storage
            .create_entry(NewEntry {
                title: Some("Second entry".into()),
                content: Some("Some very neat content.".into()),
                follows_id: Some(root),
                ..NewEntry::in_logbook(lb)
            })
            .unwrap();
        storage
            .create_entry(NewEntry {
                title: Some("Third entry".into()),
                content: Some("Not so bad content either.".into()),
                follows_id: Some(mid.id),
                ..NewEntry::in_logbook(lb)
            })
            .unwrap();

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["First entry"]);
        assert_eq!(hits[0].n_followups, 1); // direct followups of the root

        // A text filter surfaces the matching followup as its own row.
        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                content_filter: Some("neat".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["Second entry"]);
        assert_eq!(hits[0].thread_id, root);

        // So does the explicit followups flag.
        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                followups: true,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn thread_timestamp_is_latest_of_root_and_followups() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        let root_at: Timestamp = "2019-01-14T12:00:00Z".parse().unwrap();
        let reply_at: Timestamp = "2019-01-20T12:00:00Z".parse().unwrap();
        let root = storage
            .create_entry(NewEntry {
                title: Some("root".into()),
                created_at: Some(root_at),
                ..NewEntry::in_logbook(lb)
            })
            .unwrap();
        storage
            .create_entry(NewEntry {
                title: Some("reply".into()),
                created_at: Some(reply_at),
                follows_id: Some(root.id),
                ..NewEntry::in_logbook(lb)
            })
            .unwrap();

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].timestamp, reply_at);
        assert_eq!(hits[0].n_followups, 1);
        assert_eq!(hits[0].followup_authors, vec![]);
    }

    #[test]
    fn followup_authors_are_aggregated() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        let root = entry(&storage, lb, "root", "c");
        for name in ["alpha", "beta", "alpha"] {
            storage
                .create_entry(NewEntry {
                    authors: vec![Author {
                        name: name.into(),
                        login: None,
                        email: None,
                    }],
                    follows_id: Some(root),
                    ..NewEntry::in_logbook(lb)
                })
                .unwrap();
        }

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                ..SearchQuery::default()
            })
            .unwrap();
        let names: Vec<&str> = hits[0]
            .followup_authors
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(hits[0].n_followups, 3);
    }

    #[test]
    fn child_logbooks_expand_recursively() {
        let storage = test_storage();
        let parent = logbook(&storage, "Logbook1", None);
        let child = logbook(&storage, "Logbook2", Some(parent));
        let grandchild = logbook(&storage, "Logbook3", Some(child));

        entry(&storage, parent, "entry1", "This content is great!");
        entry(&storage, child, "entry2", "Some very neat content.");
        entry(&storage, grandchild, "entry3", "Other stuff.");
        entry(&storage, grandchild, "entry4", "Not so bad content either.");

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(parent),
                content_filter: Some("content".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["entry1"]);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(parent),
                child_logbooks: true,
                content_filter: Some("content".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        let mut found = titles(&hits);
        found.sort();
        assert_eq!(found, vec!["entry1", "entry2", "entry4"]);
    }

    #[test]
    fn important_entries_bubble_down_from_ancestors() {
        let storage = test_storage();
        let parent = logbook(&storage, "L", None);
        let child = logbook(&storage, "C", Some(parent));
        let important = storage
            .create_entry(NewEntry {
                title: Some("E1".into()),
                priority: 200,
                ..NewEntry::in_logbook(parent)
            })
            .unwrap();
        let normal = entry(&storage, child, "E2", "c");
        // Pinned-but-not-important entries in the ancestor stay put.
        storage
            .create_entry(NewEntry {
                title: Some("E3".into()),
                priority: 100,
                ..NewEntry::in_logbook(parent)
            })
            .unwrap();

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(child),
                child_logbooks: true,
                ..SearchQuery::default()
            })
            .unwrap();
        let mut ids: Vec<i64> = hits.iter().map(|h| h.entry.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![important.id, normal]);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(child),
                child_logbooks: false,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["E2"]);
    }

    #[test]
    fn archived_logbooks_are_excluded_from_subtree_searches() {
        let storage = test_storage();
        let parent = logbook(&storage, "parent", None);
        let child = storage
            .create_logbook(NewLogbook {
                name: "archived child".into(),
                parent_id: Some(parent),
                archived: true,
                ..NewLogbook::default()
            })
            .unwrap();
        entry(&storage, parent, "kept", "c");
        entry(&storage, child.id, "hidden", "c");

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(parent),
                child_logbooks: true,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["kept"]);

        // The global scope skips it too.
        let hits = storage.search(&SearchQuery::default()).unwrap();
        assert_eq!(titles(&hits), vec!["kept"]);
    }

    #[test]
    fn archived_entries_need_the_flag() {
        let storage = test_storage();
        let lb = logbook(&storage, "lb", None);
        entry(&storage, lb, "live", "c");
        storage
            .create_entry(NewEntry {
                title: Some("tombstone".into()),
                archived: true,
                ..NewEntry::in_logbook(lb)
            })
            .unwrap();

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["live"]);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                archived: true,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn date_filters_use_the_thread_latest_timestamp() {
        let storage = test_storage();
        let lb = logbook(&storage, "Logbook1", None);
        let mk = |title: &str, created: &str, changed: Option<&str>| {
            storage
                .create_entry(NewEntry {
                    title: Some(title.into()),
                    created_at: Some(created.parse().unwrap()),
                    last_changed_at: changed.map(|c| c.parse().unwrap()),
                    ..NewEntry::in_logbook(lb)
                })
                .unwrap();
        };
        mk("Z", "2019-01-14T12:00:00Z", None);
        mk("A", "2019-01-15T12:00:00Z", None);
        mk("B", "2019-01-17T12:00:00Z", None);
        mk("C", "2019-01-18T12:00:00Z", None);
        mk("D", "2019-01-19T12:00:00Z", Some("2019-02-06T12:00:00Z"));

        let search = |from: Option<&str>, until: Option<&str>| {
            let mut found = titles(
                &storage
                    .search(&SearchQuery {
                        logbook: Some(lb),
                        from_timestamp: from.map(|f| f.parse().unwrap()),
                        until_timestamp: until.map(|u| u.parse().unwrap()),
                        ..SearchQuery::default()
                    })
                    .unwrap(),
            );
            found.sort();
            found
        };

        assert_eq!(search(Some("2019-01-17T00:00:00Z"), None), vec!["B", "C", "D"]);
        assert_eq!(
            search(None, Some("2019-01-17T23:59:59Z")),
            vec!["A", "B", "Z"]
        );
        assert_eq!(
            search(Some("2019-01-15T00:00:00Z"), Some("2019-01-17T23:59:59Z")),
            vec!["A", "B"]
        );
        // The last change counts, not just creation.
        assert_eq!(search(Some("2019-02-01T00:00:00Z"), None), vec!["D"]);
    }

    #[test]
    fn ordering_puts_pinned_first_then_newest() {
        let storage = test_storage();
        let lb = logbook(&storage, "lb", None);
        let mk = |title: &str, created: &str, priority: i64| {
            storage
                .create_entry(NewEntry {
                    title: Some(title.into()),
                    priority,
                    created_at: Some(created.parse().unwrap()),
                    ..NewEntry::in_logbook(lb)
                })
                .unwrap();
        };
        mk("old", "2019-01-01T00:00:00Z", 0);
        mk("new", "2019-06-01T00:00:00Z", 0);
        mk("pinned", "2018-01-01T00:00:00Z", 100);

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["pinned", "new", "old"]);
    }

    #[test]
    fn pagination_applies_after_ordering() {
        let storage = test_storage();
        let lb = logbook(&storage, "lb", None);
        for (title, created) in [
            ("a", "2019-01-01T00:00:00Z"),
            ("b", "2019-01-02T00:00:00Z"),
            ("c", "2019-01-03T00:00:00Z"),
            ("d", "2019-01-04T00:00:00Z"),
        ] {
            storage
                .create_entry(NewEntry {
                    title: Some(title.into()),
                    created_at: Some(created.parse().unwrap()),
                    ..NewEntry::in_logbook(lb)
                })
                .unwrap();
        }

        let page = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                n: Some(2),
                offset: 1,
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&page), vec!["c", "b"]);

        assert_eq!(
            storage
                .search_count(&SearchQuery {
                    logbook: Some(lb),
                    n: Some(2),
                    offset: 1,
                    ..SearchQuery::default()
                })
                .unwrap(),
            4
        );
    }

    #[test]
    fn count_tallies_threads_not_followups() {
        let storage = test_storage();
        let lb = logbook(&storage, "lb", None);
        let root = entry(&storage, lb, "root", "c");
        storage
            .create_entry(NewEntry {
                follows_id: Some(root),
                ..NewEntry::in_logbook(lb)
            })
            .unwrap();
        entry(&storage, lb, "solo", "c");

        assert_eq!(
            storage
                .search_count(&SearchQuery {
                    logbook: Some(lb),
                    ..SearchQuery::default()
                })
                .unwrap(),
            2
        );
    }

    #[test]
    fn attachment_filter_matches_path() {
        let storage = test_storage();
        let lb = logbook(&storage, "lb", None);
        let with = entry(&storage, lb, "with", "c");
        entry(&storage, lb, "without", "c");
        storage.conn().execute(
            "INSERT INTO attachment (entry_id, filename, timestamp, path, embedded, archived)
             VALUES (?1, 'plot.png', '2019-01-01 00:00:00.000000',
                     '2019/01/01/1546300800-plot.png', 0, 0)",
            [with],
        )
        .unwrap();

        let hits = storage
            .search(&SearchQuery {
                logbook: Some(lb),
                attachment_filter: Some("plot\\.png".into()),
                ..SearchQuery::default()
            })
            .unwrap();
        assert_eq!(titles(&hits), vec!["with"]);
    }
}
