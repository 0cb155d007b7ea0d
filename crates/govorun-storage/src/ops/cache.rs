//! Persistence backing for the cache crate: the generic `cache_storage`
//! table, the typed `api_cache` table, and the summarization memo.

use rusqlite::params;

use crate::error::Result;
use crate::source::SqliteSource;
use crate::types::{ApiCacheRow, CacheRow};

impl SqliteSource {
    pub fn cache_upsert(&self, row: &CacheRow) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_storage (namespace, key, value, created_at, ttl_secs, persistence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (namespace, key) DO UPDATE SET
                     value = excluded.value, created_at = excluded.created_at,
                     ttl_secs = excluded.ttl_secs, persistence = excluded.persistence",
                params![
                    row.namespace,
                    row.key,
                    row.value,
                    row.created_at,
                    row.ttl_secs,
                    row.persistence,
                ],
            )?;
            Ok(())
        })
    }

    pub fn cache_get(&self, namespace: &str, key: &str) -> Result<Option<CacheRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT namespace, key, value, created_at, ttl_secs, persistence
                 FROM cache_storage WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                row_to_cache,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
        })
    }

    pub fn cache_delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_storage WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )?;
            Ok(())
        })
    }

    pub fn cache_clear(&self, namespace: &str) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute("DELETE FROM cache_storage WHERE namespace = ?1", [namespace])?;
            Ok(())
        })
    }

    /// Every persisted cache row of this source.
    pub fn cache_dump(&self) -> Result<Vec<CacheRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT namespace, key, value, created_at, ttl_secs, persistence
                 FROM cache_storage ORDER BY namespace, key",
            )?;
            let rows = stmt.query_map([], row_to_cache)?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
    }

    pub fn api_cache_set(&self, domain: &str, key: &str, value: &serde_json::Value, stored_at: i64) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO api_cache (domain, key, value, stored_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (domain, key) DO UPDATE SET
                     value = excluded.value, stored_at = excluded.stored_at",
                params![domain, key, value.to_string(), stored_at],
            )?;
            Ok(())
        })
    }

    pub fn api_cache_get(&self, domain: &str, key: &str) -> Result<Option<ApiCacheRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT domain, key, value, stored_at FROM api_cache
                 WHERE domain = ?1 AND key = ?2",
                params![domain, key],
                |r| {
                    let value_str: String = r.get(2)?;
                    Ok(ApiCacheRow {
                        domain: r.get(0)?,
                        key: r.get(1)?,
                        value: serde_json::from_str(&value_str)
                            .unwrap_or(serde_json::Value::Null),
                        stored_at: r.get(3)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
        })
    }

    pub fn summary_set(&self, csid: &str, summary: &str, created_at: i64) -> Result<()> {
        self.check_writable()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO summaries (csid, summary, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (csid) DO UPDATE SET summary = excluded.summary",
                params![csid, summary, created_at],
            )?;
            Ok(())
        })
    }

    pub fn summary_get(&self, csid: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT summary FROM summaries WHERE csid = ?1", [csid], |r| {
                r.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
        })
    }
}

fn row_to_cache(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheRow> {
    Ok(CacheRow {
        namespace: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at: row.get(3)?,
        ttl_secs: row.get(4)?,
        persistence: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::open_migrated;

    #[test]
    fn cache_rows_round_trip() {
        let (_dir, src) = open_migrated();
        src.cache_upsert(&CacheRow {
            namespace: "chat_settings".to_string(),
            key: "-100".to_string(),
            value: "{}".to_string(),
            created_at: 1000,
            ttl_secs: Some(60),
            persistence: "on-change".to_string(),
        })
        .unwrap();

        let row = src.cache_get("chat_settings", "-100").unwrap().unwrap();
        assert_eq!(row.ttl_secs, Some(60));

        src.cache_delete("chat_settings", "-100").unwrap();
        assert!(src.cache_get("chat_settings", "-100").unwrap().is_none());
    }

    #[test]
    fn clear_removes_only_the_namespace() {
        let (_dir, src) = open_migrated();
        for (ns, key) in [("a", "1"), ("a", "2"), ("b", "1")] {
            src.cache_upsert(&CacheRow {
                namespace: ns.to_string(),
                key: key.to_string(),
                value: "v".to_string(),
                created_at: 0,
                ttl_secs: None,
                persistence: "on-change".to_string(),
            })
            .unwrap();
        }
        src.cache_clear("a").unwrap();
        assert!(src.cache_get("a", "1").unwrap().is_none());
        assert!(src.cache_get("b", "1").unwrap().is_some());
    }

    #[test]
    fn api_cache_stores_raw_json() {
        let (_dir, src) = open_migrated();
        let payload = serde_json::json!({ "temp": -3.5, "wind": 7 });
        src.api_cache_set("weather", "Minsk", &payload, 1000).unwrap();
        let row = src.api_cache_get("weather", "Minsk").unwrap().unwrap();
        assert_eq!(row.value["temp"], -3.5);
        assert_eq!(row.stored_at, 1000);
        assert!(src.api_cache_get("weather", "Pinsk").unwrap().is_none());
    }

    #[test]
    fn summary_memo_round_trip() {
        let (_dir, src) = open_migrated();
        src.summary_set("abc123", "short summary", 1000).unwrap();
        assert_eq!(
            src.summary_get("abc123").unwrap(),
            Some("short summary".to_string())
        );
        assert_eq!(src.summary_get("zzz").unwrap(), None);
    }
}
