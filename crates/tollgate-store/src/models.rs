use rusqlite::Connection;

use crate::error::Result;
use crate::types::ModelInfo;

pub(crate) fn row_to_model(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelInfo> {
    Ok(ModelInfo {
        name: row.get(0)?,
        provider: row.get(1)?,
        prompt_price: row.get(2)?,
        completion_price: row.get(3)?,
        context_window: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
    })
}

/// All enabled catalog entries. The registry snapshots this at startup.
pub fn enabled_models(conn: &Connection) -> Result<Vec<ModelInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, provider, prompt_price, completion_price, context_window, enabled
         FROM models WHERE enabled = 1 ORDER BY name",
    )?;
    let rows = stmt.query_map([], row_to_model)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;

    #[test]
    fn disabled_models_are_excluded() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            conn.execute("UPDATE models SET enabled = 0 WHERE name = 'gpt-4o'", [])?;
            let models = enabled_models(conn)?;
            assert!(models.iter().all(|m| m.name != "gpt-4o"));
            assert!(models.iter().any(|m| m.name == "gpt-3.5-turbo"));
            Ok(())
        })
        .unwrap();
    }
}
