//! Company persistence.

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::models::Company;

/// Fetch a company by id.
pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Company>, sqlx::Error> {
    sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Create a company for `website_url` or update the existing one.
///
/// `name` and `context` only overwrite stored values when provided, so a
/// re-upload without company metadata keeps what an earlier upload supplied.
pub async fn upsert_by_website(
    conn: &mut SqliteConnection,
    website_url: &str,
    name: Option<&str>,
    context: Option<&str>,
) -> Result<Company, sqlx::Error> {
    sqlx::query_as::<_, Company>(
        "INSERT INTO companies (id, website_url, name, context) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(website_url) DO UPDATE SET \
             name = COALESCE(excluded.name, companies.name), \
             context = COALESCE(excluded.context, companies.context) \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(website_url)
    .bind(name)
    .bind(context)
    .fetch_one(conn)
    .await
}
