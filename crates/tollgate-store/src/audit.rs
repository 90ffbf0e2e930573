use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ToSql};

use crate::error::Result;
use crate::types::{now_str, parse_ts, AuditEntry, AuditRecord};

/// Append one audit row. Admin mutations call this inside the same
/// transaction as the change they record.
pub fn append(conn: &Connection, entry: &AuditEntry) -> Result<()> {
    let details = entry
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO audit_logs
         (user_id, action, resource_type, resource_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            entry.user_id,
            entry.action,
            entry.resource_type,
            entry.resource_id,
            details,
            now_str(),
        ],
    )?;
    Ok(())
}

/// Optional filters for browsing the audit trail. `until` is exclusive.
#[derive(Debug, Default)]
pub struct AuditFilter {
    pub user_id: Option<i64>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let details: Option<String> = row.get(5)?;
    let created: String = row.get(6)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        action: row.get(2)?,
        resource_type: row.get(3)?,
        resource_id: row.get(4)?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        created_at: parse_ts(&created),
    })
}

/// Audit rows matching the filter, newest first.
pub fn list(
    conn: &Connection,
    filter: &AuditFilter,
    skip: usize,
    limit: usize,
) -> Result<Vec<AuditRecord>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(user_id) = filter.user_id {
        clauses.push("user_id = ?");
        params.push(Box::new(user_id));
    }
    if let Some(ref action) = filter.action {
        clauses.push("action = ?");
        params.push(Box::new(action.clone()));
    }
    if let Some(ref resource_type) = filter.resource_type {
        clauses.push("resource_type = ?");
        params.push(Box::new(resource_type.clone()));
    }
    if let Some(since) = filter.since {
        clauses.push("created_at >= ?");
        params.push(Box::new(since.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at < ?");
        params.push(Box::new(until.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    params.push(Box::new(limit as i64));
    params.push(Box::new(skip as i64));

    let sql = format!(
        "SELECT id, user_id, action, resource_type, resource_id, details, created_at
         FROM audit_logs {where_clause}
         ORDER BY created_at DESC, id DESC
         LIMIT ? OFFSET ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
        row_to_record,
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;

    fn entry(user_id: i64, action: &str, resource_type: &str) -> AuditEntry {
        AuditEntry {
            user_id: Some(user_id),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: Some("100001".to_string()),
            details: None,
        }
    }

    #[test]
    fn appends_with_json_details() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            append(
                conn,
                &AuditEntry {
                    user_id: Some(9),
                    action: "top_up".to_string(),
                    resource_type: "user".to_string(),
                    resource_id: Some("100001".to_string()),
                    details: Some(serde_json::json!({"amount": 1000})),
                },
            )?;
            let (action, details): (String, String) = conn.query_row(
                "SELECT action, details FROM audit_logs",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(action, "top_up");
            assert!(details.contains("1000"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn list_reads_back_newest_first() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            append(conn, &entry(1, "top_up", "user"))?;
            append(conn, &entry(1, "set_limit", "user"))?;

            let records = list(conn, &AuditFilter::default(), 0, 100)?;
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].action, "set_limit");
            assert_eq!(records[1].action, "top_up");
            assert_eq!(records[1].resource_id.as_deref(), Some("100001"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn filters_compose() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            append(conn, &entry(1, "top_up", "user"))?;
            append(conn, &entry(2, "top_up", "user"))?;
            append(conn, &entry(1, "deduct", "user"))?;

            let by_user = list(
                conn,
                &AuditFilter {
                    user_id: Some(1),
                    ..AuditFilter::default()
                },
                0,
                100,
            )?;
            assert_eq!(by_user.len(), 2);

            let by_user_and_action = list(
                conn,
                &AuditFilter {
                    user_id: Some(1),
                    action: Some("top_up".to_string()),
                    ..AuditFilter::default()
                },
                0,
                100,
            )?;
            assert_eq!(by_user_and_action.len(), 1);

            let none = list(
                conn,
                &AuditFilter {
                    resource_type: Some("dialog".to_string()),
                    ..AuditFilter::default()
                },
                0,
                100,
            )?;
            assert!(none.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn date_range_bounds_are_inclusive_exclusive() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            append(conn, &entry(1, "top_up", "user"))?;
            let now = Utc::now();

            let hit = list(
                conn,
                &AuditFilter {
                    since: Some(now - chrono::Duration::hours(1)),
                    until: Some(now + chrono::Duration::hours(1)),
                    ..AuditFilter::default()
                },
                0,
                100,
            )?;
            assert_eq!(hit.len(), 1);

            let miss = list(
                conn,
                &AuditFilter {
                    until: Some(now - chrono::Duration::hours(1)),
                    ..AuditFilter::default()
                },
                0,
                100,
            )?;
            assert!(miss.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn pagination_applies_after_filtering() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            for _ in 0..5 {
                append(conn, &entry(1, "top_up", "user"))?;
            }
            let page = list(conn, &AuditFilter::default(), 2, 2)?;
            assert_eq!(page.len(), 2);
            Ok(())
        })
        .unwrap();
    }
}
