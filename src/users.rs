#![cfg(not(tarpaulin_include))]

use crate::error::{AppError, Result};
use crate::login::hash_password;
use crate::models::{Role, SessionUser, User, UserInput, format_timestamp, non_empty, now};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;

const USER_COLUMNS: &str = "id, username, password, full_name, role, region, state, lga, email, phone, is_active, created_at, last_login";

/// Column a bulk user operation groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserGroup {
    Region,
    State,
    Lga,
}

impl UserGroup {
    pub fn parse(value: &str) -> Option<UserGroup> {
        match value.trim() {
            "region" => Some(UserGroup::Region),
            "state" => Some(UserGroup::State),
            "lga" => Some(UserGroup::Lga),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            UserGroup::Region => "region",
            UserGroup::State => "state",
            UserGroup::Lga => "lga",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserPreview {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub region: Option<String>,
    pub state: Option<String>,
    pub lga: Option<String>,
    pub execution_count: i64,
}

fn required_fields(input: &UserInput, password_required: bool) -> Result<Role> {
    let mut missing = Vec::new();
    if input.username.trim().is_empty() {
        missing.push("username");
    }
    if password_required && input.password.trim().is_empty() {
        missing.push("password");
    }
    if input.full_name.trim().is_empty() {
        missing.push("full_name");
    }
    if input.role.trim().is_empty() {
        missing.push("role");
    }
    if !missing.is_empty() {
        return Err(AppError::validation(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }
    if input.username.trim().chars().count() < 3 {
        return Err(AppError::validation(
            "Username must be at least 3 characters",
        ));
    }
    Role::parse(&input.role)
        .ok_or_else(|| AppError::validation(format!("Invalid role '{}'", input.role.trim())))
}

/// Create a user with an argon2-hashed password and return its id.
///
/// # Errors
/// * `Validation` for missing fields or an unknown role
/// * `Conflict` if the username is taken
pub async fn create(conn: &mut SqliteConnection, input: UserInput) -> Result<i64> {
    let role = required_fields(&input, true)?;
    let username = input.username.trim();

    if find_by_username(conn, username).await?.is_some() {
        return Err(AppError::conflict("Username already exists"));
    }

    let hash = hash_password(input.password.trim())?;
    let timestamp = format_timestamp(now());
    let id = sqlx::query(
        "INSERT INTO users (username, password, full_name, role, region, state, lga, email, phone, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(username)
    .bind(hash)
    .bind(input.full_name.trim())
    .bind(role)
    .bind(non_empty(&input.region))
    .bind(non_empty(&input.state))
    .bind(non_empty(&input.lga))
    .bind(non_empty(&input.email))
    .bind(non_empty(&input.phone))
    .bind(&timestamp)
    .bind(&timestamp)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    info!(user_id = id, %username, role = %role, "user created");
    Ok(id)
}

/// Update a user's profile fields; a blank password keeps the current one.
///
/// # Errors
/// * `NotFound` if the user does not exist
/// * `Forbidden` if an admin tries to take away their own admin role
/// * `Conflict` if the new username belongs to someone else
pub async fn update(
    conn: &mut SqliteConnection,
    id: i64,
    input: UserInput,
    acting: &SessionUser,
) -> Result<()> {
    let role = required_fields(&input, false)?;
    let existing = get(conn, id).await?;

    if acting.user_id == id && existing.role == Role::Admin && role != Role::Admin {
        return Err(AppError::Forbidden(
            "You cannot remove your own admin role".into(),
        ));
    }

    let username = input.username.trim();
    if let Some(other) = find_by_username(conn, username).await? {
        if other.id != id {
            return Err(AppError::conflict("Username already exists"));
        }
    }

    let password = match non_empty(&input.password) {
        Some(password) => hash_password(&password)?,
        None => existing.password,
    };

    sqlx::query(
        "UPDATE users SET username = ?, password = ?, full_name = ?, role = ?, region = ?, state = ?, lga = ?,
         email = ?, phone = ?, updated_at = ? WHERE id = ?",
    )
    .bind(username)
    .bind(password)
    .bind(input.full_name.trim())
    .bind(role)
    .bind(non_empty(&input.region))
    .bind(non_empty(&input.state))
    .bind(non_empty(&input.lga))
    .bind(non_empty(&input.email))
    .bind(non_empty(&input.phone))
    .bind(format_timestamp(now()))
    .bind(id)
    .execute(&mut *conn)
    .await?;

    info!(user_id = id, "user updated");
    Ok(())
}

async fn execution_count(conn: &mut SqliteConnection, user_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM executions WHERE agent_id = ?")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Delete a user that has no recorded executions.
///
/// # Errors
/// * `Forbidden` when deleting your own account
/// * `Conflict` when the user still has executions
/// * `NotFound` when the user does not exist
pub async fn delete(conn: &mut SqliteConnection, id: i64, acting: &SessionUser) -> Result<()> {
    if acting.user_id == id {
        return Err(AppError::Forbidden("You cannot delete your own account".into()));
    }
    let user = get(conn, id).await?;

    let executions = execution_count(conn, id).await?;
    if executions > 0 {
        return Err(AppError::conflict(format!(
            "Cannot delete user with {} executions",
            executions
        )));
    }

    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    info!(user_id = id, username = %user.username, "user deleted");
    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<User> {
    sqlx::query_as::<_, User>(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}

pub async fn find_by_username(conn: &mut SqliteConnection, username: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {} FROM users WHERE username = ?",
        USER_COLUMNS
    ))
    .bind(username.trim())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(user)
}

pub async fn list_all(conn: &mut SqliteConnection) -> Result<Vec<User>> {
    let users = sqlx::query_as::<_, User>(&format!(
        "SELECT {} FROM users ORDER BY username",
        USER_COLUMNS
    ))
    .fetch_all(&mut *conn)
    .await?;
    Ok(users)
}

/// Agent credited with bulk-uploaded executions: the first active admin,
/// falling back to the first active user of any role.
pub async fn first_active_admin_or_user(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM users WHERE is_active = 1
         ORDER BY CASE WHEN role = 'admin' THEN 0 ELSE 1 END, id LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Users that a bulk delete on `group = value` would consider.
pub async fn bulk_preview(
    conn: &mut SqliteConnection,
    group: UserGroup,
    value: &str,
) -> Result<Vec<UserPreview>> {
    let users = sqlx::query_as::<_, UserPreview>(&format!(
        "SELECT u.id, u.username, u.full_name, u.role, u.region, u.state, u.lga,
                (SELECT COUNT(*) FROM executions e WHERE e.agent_id = u.id) AS execution_count
         FROM users u WHERE u.{} = ? ORDER BY u.username",
        group.column()
    ))
    .bind(value.trim())
    .fetch_all(&mut *conn)
    .await?;
    Ok(users)
}

/// Options for [`bulk_delete`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkDeleteOptions {
    pub skip_with_executions: bool,
    pub skip_admins: bool,
}

/// Delete every user whose `group` column equals `value`.
///
/// The acting user is never deleted. Users with executions are skipped when
/// requested; otherwise their executions are removed with them.
///
/// # Errors
/// * `Validation` when no user matches
pub async fn bulk_delete(
    conn: &mut SqliteConnection,
    group: UserGroup,
    value: &str,
    options: BulkDeleteOptions,
    acting: &SessionUser,
) -> Result<u64> {
    let mut sql = format!("SELECT id FROM users WHERE {} = ? AND id != ?", group.column());
    if options.skip_with_executions {
        sql.push_str(" AND id NOT IN (SELECT DISTINCT agent_id FROM executions)");
    }
    if options.skip_admins {
        sql.push_str(" AND role != 'admin'");
    }

    let ids: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(value.trim())
        .bind(acting.user_id)
        .fetch_all(&mut *conn)
        .await?;
    if ids.is_empty() {
        return Err(AppError::validation("No records found matching the criteria"));
    }

    let mut deleted = 0;
    for &id in &ids {
        sqlx::query("DELETE FROM executions WHERE agent_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        deleted += sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }

    info!(group = group.column(), %value, deleted, "bulk user delete");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    fn input(username: &str, role: &str, region: &str) -> UserInput {
        UserInput {
            username: username.into(),
            password: "secret1".into(),
            full_name: format!("{} name", username),
            role: role.into(),
            region: region.into(),
            ..Default::default()
        }
    }

    async fn setup() -> (SqlitePool, SessionUser) {
        let pool = crate::db::connect_in_memory().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let admin_id = create(&mut conn, input("boss", "admin", "ALL")).await.unwrap();
        let admin = SessionUser::from(&get(&mut conn, admin_id).await.unwrap());
        drop(conn);
        (pool, admin)
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let (pool, _) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let err = create(&mut conn, input("boss", "field_agent", "SW")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_role_and_missing_fields() {
        let (pool, _) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let err = create(&mut conn, input("newbie", "janitor", "SW")).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid role 'janitor'");

        let mut blank = input("newbie", "admin", "SW");
        blank.password.clear();
        let err = create(&mut conn, blank).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields: password");
    }

    #[tokio::test]
    async fn admin_cannot_demote_or_delete_self() {
        let (pool, admin) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let err = update(&mut conn, admin.user_id, input("boss", "field_agent", "ALL"), &admin)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = delete(&mut conn, admin.user_id, &admin).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn blank_password_keeps_hash() {
        let (pool, admin) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = create(&mut conn, input("agent1", "field_agent", "SW")).await.unwrap();
        let before = get(&mut conn, id).await.unwrap().password;

        let mut changes = input("agent1", "field_agent", "NW");
        changes.password.clear();
        update(&mut conn, id, changes, &admin).await.unwrap();

        let after = get(&mut conn, id).await.unwrap();
        assert_eq!(after.password, before);
        assert_eq!(after.region.as_deref(), Some("NW"));
    }

    #[tokio::test]
    async fn user_with_executions_cannot_be_deleted() {
        let (pool, admin) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let agent = create(&mut conn, input("agent1", "field_agent", "SW")).await.unwrap();
        sqlx::query("INSERT INTO outlets (urn, outlet_name, region) VALUES ('U1', 'Shop', 'SW')")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO executions (outlet_id, agent_id, execution_date, status) VALUES (1, ?, '2025-01-01 10:00:00', 'Completed')")
            .bind(agent)
            .execute(&mut *conn)
            .await
            .unwrap();

        let err = delete(&mut conn, agent, &admin).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete user with 1 executions");
    }

    #[tokio::test]
    async fn bulk_delete_respects_options() {
        let (pool, admin) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        create(&mut conn, input("agent1", "field_agent", "SW")).await.unwrap();
        create(&mut conn, input("agent2", "field_agent", "SW")).await.unwrap();
        create(&mut conn, input("lead1", "admin", "SW")).await.unwrap();
        create(&mut conn, input("agent3", "field_agent", "NE")).await.unwrap();

        let preview = bulk_preview(&mut conn, UserGroup::Region, "SW").await.unwrap();
        assert_eq!(preview.len(), 3);

        let options = BulkDeleteOptions {
            skip_admins: true,
            ..Default::default()
        };
        let deleted = bulk_delete(&mut conn, UserGroup::Region, "SW", options, &admin)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(find_by_username(&mut conn, "lead1").await.unwrap().is_some());

        let err = bulk_delete(&mut conn, UserGroup::Region, "ALL", options, &admin)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No records found matching the criteria");
    }

    #[tokio::test]
    async fn admin_preferred_as_upload_agent() {
        let (pool, admin) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        create(&mut conn, input("agent1", "field_agent", "SW")).await.unwrap();
        assert_eq!(
            first_active_admin_or_user(&mut conn).await.unwrap(),
            Some(admin.user_id)
        );
    }
}
