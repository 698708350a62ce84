//! User directory: accounts in `users.csv`.

use std::sync::Arc;

use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::clock::Clock;
use crate::codec::Record;
use crate::error::{Result, StoreError};
use crate::models::{format_timestamp, Role, UserAccount};
use crate::password::PasswordHasher;
use crate::table::TableStore;

pub const MIN_USERNAME_LEN: usize = 3;
pub const MIN_PASSWORD_LEN: usize = 6;

const INVALID_CREDENTIALS: &str = "invalid credentials";

pub struct UserDirectory {
    tables: Arc<TableStore>,
    clock: Arc<dyn Clock>,
    hasher: PasswordHasher,
    users: Mutex<Option<Vec<UserAccount>>>,
}

impl UserDirectory {
    pub fn new(tables: Arc<TableStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_hasher(tables, clock, PasswordHasher::default())
    }

    pub fn with_hasher(tables: Arc<TableStore>, clock: Arc<dyn Clock>, hasher: PasswordHasher) -> Self {
        Self {
            tables,
            clock,
            hasher,
            users: Mutex::new(None),
        }
    }

    async fn loaded(&self) -> Result<MappedMutexGuard<'_, Vec<UserAccount>>> {
        let mut guard = self.users.lock().await;
        if guard.is_none() {
            let users: Vec<UserAccount> = self.tables.read_all(UserAccount::FILE).await?;
            tracing::debug!("Loaded {} user(s)", users.len());
            *guard = Some(users);
        }
        Ok(MutexGuard::map(guard, |slot| slot.get_or_insert_with(Vec::new)))
    }

    /// Rewrite `users.csv` with `updated` and adopt it as the cached state.
    async fn commit(&self, users: &mut Vec<UserAccount>, updated: Vec<UserAccount>) -> Result<()> {
        self.tables
            .write_all(UserAccount::FILE, &updated, UserAccount::FIELDS)
            .await?;
        *users = updated;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, password: &str, role: Role) -> Result<UserAccount> {
        let username = validate_username(username)?;
        validate_password(password)?;

        let mut users = self.loaded().await?;
        if users.iter().any(|u| u.username == username) {
            return Err(StoreError::conflict(format!("username '{username}' is already taken")));
        }

        let account = UserAccount {
            username: username.to_owned(),
            password: self.hasher.hash(password).await?,
            role,
            created_at: format_timestamp(self.clock.now()),
            active: true,
        };
        self.tables
            .append(UserAccount::FILE, &account, UserAccount::FIELDS)
            .await?;
        users.push(account.clone());

        tracing::info!("Created {} account {}", account.role, account.username);
        Ok(account)
    }

    /// Check credentials. Unknown users and wrong passwords get the same
    /// answer; a deactivated account is reported as such only after its
    /// password checked out. A legacy scrypt hash is replaced with an
    /// Argon2id one once the password has been confirmed.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<UserAccount> {
        let mut users = self.loaded().await?;
        let Some(idx) = users.iter().position(|u| u.username == username.trim()) else {
            return Err(StoreError::unauthorized(INVALID_CREDENTIALS));
        };

        let stored = users[idx].password.clone();
        if !self.hasher.verify(password, &stored).await? {
            tracing::warn!("Failed login for {}", users[idx].username);
            return Err(StoreError::unauthorized(INVALID_CREDENTIALS));
        }
        if !users[idx].active {
            return Err(StoreError::unauthorized("account is deactivated"));
        }
        if PasswordHasher::needs_rehash(&stored) {
            self.upgrade_hash(&mut users, idx, password).await;
        }
        Ok(users[idx].clone())
    }

    /// Best effort: the login already succeeded, a failed rewrite only
    /// means the upgrade is retried next time.
    async fn upgrade_hash(&self, users: &mut Vec<UserAccount>, idx: usize, password: &str) {
        let hash = match self.hasher.hash(password).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!("Could not re-hash password for {}: {}", users[idx].username, e);
                return;
            }
        };
        let mut updated = users.clone();
        updated[idx].password = hash;
        match self.commit(users, updated).await {
            Ok(()) => tracing::info!("Upgraded password hash for {}", users[idx].username),
            Err(e) => tracing::warn!("Could not store upgraded hash for {}: {}", users[idx].username, e),
        }
    }

    pub async fn get_user(&self, username: &str) -> Result<Option<UserAccount>> {
        let users = self.loaded().await?;
        Ok(users.iter().find(|u| u.username == username).cloned())
    }

    pub async fn get_all_users(&self) -> Result<Vec<UserAccount>> {
        Ok(self.loaded().await?.clone())
    }

    /// Set a new password. `current` must be given and correct for a
    /// self-service change; pass `None` for an admin reset.
    pub async fn change_password(&self, username: &str, current: Option<&str>, new_password: &str) -> Result<()> {
        validate_password(new_password)?;
        let mut users = self.loaded().await?;
        let idx = find_index(&users, username)?;

        if let Some(current) = current {
            if !self.hasher.verify(current, &users[idx].password).await? {
                return Err(StoreError::unauthorized("current password is incorrect"));
            }
        }

        let mut updated = users.clone();
        updated[idx].password = self.hasher.hash(new_password).await?;
        self.commit(&mut users, updated).await?;

        tracing::info!("Password changed for {}", username);
        Ok(())
    }

    /// Change `username`'s role on behalf of admin `actor`.
    pub async fn update_role(&self, actor: &str, username: &str, role: Role) -> Result<UserAccount> {
        let mut users = self.loaded().await?;
        require_admin(&users, actor)?;
        let idx = find_index(&users, username)?;

        let mut updated = users.clone();
        updated[idx].role = role;
        keeps_an_admin(&updated)?;
        let account = updated[idx].clone();
        self.commit(&mut users, updated).await?;

        tracing::info!("{} set role of {} to {}", actor, username, role);
        Ok(account)
    }

    /// Soft-delete `username`. Admins cannot deactivate themselves.
    pub async fn deactivate_user(&self, actor: &str, username: &str) -> Result<UserAccount> {
        if actor == username {
            return Err(StoreError::validation("you cannot deactivate your own account"));
        }
        let mut users = self.loaded().await?;
        require_admin(&users, actor)?;
        let idx = find_index(&users, username)?;

        let mut updated = users.clone();
        updated[idx].active = false;
        keeps_an_admin(&updated)?;
        let account = updated[idx].clone();
        self.commit(&mut users, updated).await?;

        tracing::info!("{} deactivated {}", actor, username);
        Ok(account)
    }

    pub async fn reactivate_user(&self, username: &str) -> Result<UserAccount> {
        let mut users = self.loaded().await?;
        let idx = find_index(&users, username)?;

        let mut updated = users.clone();
        updated[idx].active = true;
        let account = updated[idx].clone();
        self.commit(&mut users, updated).await?;

        tracing::info!("Reactivated {}", username);
        Ok(account)
    }

    /// Make sure `username` exists as an active admin. Creates the account
    /// with `password` when missing; an existing account keeps its password.
    /// Returns `true` when an account was created.
    pub async fn ensure_admin(&self, username: &str, password: &str) -> Result<bool> {
        let existing = self.get_user(username.trim()).await?;
        let Some(existing) = existing else {
            self.create_user(username, password, Role::Admin).await?;
            return Ok(true);
        };
        if existing.is_active_admin() {
            return Ok(false);
        }

        let mut users = self.loaded().await?;
        let idx = find_index(&users, &existing.username)?;
        let mut updated = users.clone();
        updated[idx].role = Role::Admin;
        updated[idx].active = true;
        self.commit(&mut users, updated).await?;

        tracing::info!("Promoted {} to active admin", existing.username);
        Ok(false)
    }
}

fn validate_username(raw: &str) -> Result<&str> {
    let username = raw.trim();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(StoreError::validation(format!(
            "username must be at least {MIN_USERNAME_LEN} characters"
        )));
    }
    Ok(username)
}

fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(StoreError::validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn find_index(users: &[UserAccount], username: &str) -> Result<usize> {
    users
        .iter()
        .position(|u| u.username == username)
        .ok_or_else(|| StoreError::not_found(format!("user '{username}'")))
}

fn require_admin(users: &[UserAccount], actor: &str) -> Result<()> {
    match users.iter().find(|u| u.username == actor) {
        Some(user) if user.is_active_admin() => Ok(()),
        _ => Err(StoreError::unauthorized("admin privileges required")),
    }
}

fn keeps_an_admin(users: &[UserAccount]) -> Result<()> {
    if users.iter().any(UserAccount::is_active_admin) {
        Ok(())
    } else {
        Err(StoreError::validation("at least one active admin must remain"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use argon2::Params;
    use tempfile::TempDir;

    fn directory() -> (UserDirectory, Arc<TableStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let tables = Arc::new(TableStore::new(dir.path()));
        let hasher = PasswordHasher::with_params(Params::new(1024, 1, 1, None).unwrap());
        let users = UserDirectory::with_hasher(tables.clone(), Arc::new(SystemClock), hasher);
        (users, tables, dir)
    }

    #[tokio::test]
    async fn create_and_authenticate() {
        let (users, _tables, _dir) = directory();
        let created = users.create_user("alice", "secret1", Role::User).await.unwrap();
        assert!(created.active);
        assert_ne!(created.password, "secret1");

        let authed = users.authenticate("alice", "secret1").await.unwrap();
        assert_eq!(authed.username, "alice");
    }

    #[tokio::test]
    async fn legacy_scrypt_account_logs_in_and_is_upgraded() {
        let (users, tables, _dir) = directory();
        std::fs::write(
            tables.path(UserAccount::FILE),
            "username,password,role,createdAt,active\n\
             old-timer,000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f:5c0b0c59ad048a8a892c368a3008d9c02606fbc624035c4815cf7f80ba75c1ced4c56bae1087abb751dc721068c4334f23a2c86db951b2bb67daa78b022d3eb8,admin,2024-01-01T00:00:00.000Z,true\n",
        )
        .unwrap();

        assert!(users.authenticate("old-timer", "wrong-pass").await.is_err());
        let authed = users.authenticate("old-timer", "legacy-pass").await.unwrap();
        assert!(authed.password.starts_with("$argon2id$"));

        let reloaded = UserDirectory::with_hasher(
            tables,
            Arc::new(SystemClock),
            PasswordHasher::with_params(Params::new(1024, 1, 1, None).unwrap()),
        );
        let stored = reloaded.get_user("old-timer").await.unwrap().unwrap();
        assert!(stored.password.starts_with("$argon2id$"));
        assert!(reloaded.authenticate("old-timer", "legacy-pass").await.is_ok());
    }

    #[tokio::test]
    async fn bad_credentials_look_the_same() {
        let (users, _tables, _dir) = directory();
        users.create_user("alice", "secret1", Role::User).await.unwrap();

        let wrong = users.authenticate("alice", "wrong-pass").await.unwrap_err();
        let unknown = users.authenticate("nobody", "secret1").await.unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert_eq!(wrong.status_code(), 401);
    }

    #[tokio::test]
    async fn input_rules_and_uniqueness() {
        let (users, _tables, _dir) = directory();
        assert!(matches!(
            users.create_user("al", "secret1", Role::User).await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            users.create_user("alice", "short", Role::User).await,
            Err(StoreError::Validation(_))
        ));
        users.create_user("alice", "secret1", Role::User).await.unwrap();
        assert!(matches!(
            users.create_user("alice", "secret2", Role::Admin).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_accounts_cannot_log_in() {
        let (users, _tables, _dir) = directory();
        users.create_user("root", "rootpass", Role::Admin).await.unwrap();
        users.create_user("bob", "bobpass", Role::User).await.unwrap();

        users.deactivate_user("root", "bob").await.unwrap();
        let err = users.authenticate("bob", "bobpass").await.unwrap_err();
        assert!(err.to_string().contains("deactivated"));

        users.reactivate_user("bob").await.unwrap();
        assert!(users.authenticate("bob", "bobpass").await.is_ok());
    }

    #[tokio::test]
    async fn last_admin_is_protected() {
        let (users, _tables, _dir) = directory();
        users.create_user("root", "rootpass", Role::Admin).await.unwrap();

        let demote = users.update_role("root", "root", Role::User).await;
        assert!(matches!(demote, Err(StoreError::Validation(_))));
        let self_deactivate = users.deactivate_user("root", "root").await;
        assert!(matches!(self_deactivate, Err(StoreError::Validation(_))));

        users.create_user("second", "secondpass", Role::User).await.unwrap();
        users.update_role("root", "second", Role::Admin).await.unwrap();
        users.update_role("root", "root", Role::User).await.unwrap();

        let all = users.get_all_users().await.unwrap();
        assert_eq!(all.iter().filter(|u| u.is_active_admin()).count(), 1);
    }

    #[tokio::test]
    async fn only_admins_manage_users() {
        let (users, _tables, _dir) = directory();
        users.create_user("root", "rootpass", Role::Admin).await.unwrap();
        users.create_user("bob", "bobpass", Role::User).await.unwrap();

        let err = users.update_role("bob", "bob", Role::Admin).await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
        let err = users.deactivate_user("bob", "root").await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn change_password_requires_current_unless_reset() {
        let (users, _tables, _dir) = directory();
        users.create_user("alice", "secret1", Role::User).await.unwrap();

        let err = users
            .change_password("alice", Some("not-it"), "secret2")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));

        users.change_password("alice", Some("secret1"), "secret2").await.unwrap();
        assert!(users.authenticate("alice", "secret2").await.is_ok());

        users.change_password("alice", None, "secret3").await.unwrap();
        assert!(users.authenticate("alice", "secret3").await.is_ok());
        assert!(users.authenticate("alice", "secret2").await.is_err());
    }

    #[tokio::test]
    async fn ensure_admin_is_idempotent() {
        let (users, tables, _dir) = directory();
        assert!(users.ensure_admin("admin", "adminpass").await.unwrap());
        assert!(!users.ensure_admin("admin", "different").await.unwrap());
        assert!(users.authenticate("admin", "adminpass").await.is_ok());

        let reloaded = UserDirectory::with_hasher(
            tables,
            Arc::new(SystemClock),
            PasswordHasher::with_params(Params::new(1024, 1, 1, None).unwrap()),
        );
        let all = reloaded.get_all_users().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_active_admin());
    }

    #[tokio::test]
    async fn ensure_admin_promotes_existing_user() {
        let (users, _tables, _dir) = directory();
        users.create_user("root", "rootpass", Role::Admin).await.unwrap();
        users.create_user("ops", "opspass", Role::User).await.unwrap();
        users.deactivate_user("root", "ops").await.unwrap();

        assert!(!users.ensure_admin("ops", "ignored").await.unwrap());
        let ops = users.get_user("ops").await.unwrap().unwrap();
        assert!(ops.is_active_admin());
        assert!(users.authenticate("ops", "opspass").await.is_ok());
    }
}
