//! Accounts and login sessions.

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("user '{0}' already exists")]
    UserExists(String),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("cannot remove the last administrator")]
    LastAdmin,

    #[error("user '{0}' is not active")]
    Inactive(String),

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("unknown or expired session")]
    InvalidSession,
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Experimenter,
}

#[derive(Debug, Clone)]
pub struct User {
    username: String,
    password_hash: String,
    role: Role,
}

impl User {
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Users with bcrypt password hashes and the sessions opened by `login`.
pub struct AuthManager {
    users: RwLock<HashMap<String, User>>,
    sessions: RwLock<HashMap<Uuid, String>>,
}

impl AuthManager {
    /// A manager holding one administrator.
    pub fn with_admin(username: &str, password: &str) -> AuthResult<Self> {
        validate_username(username)?;
        let admin = User {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            role: Role::Admin,
        };
        Ok(Self {
            users: RwLock::new(HashMap::from([(username.to_string(), admin)])),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> AuthResult<User> {
        let users = self.users.read().await;
        let user = users.get(username).ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(password, &user.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(user.clone())
    }

    /// Check the credentials and open a session.
    pub async fn login(&self, username: &str, password: &str) -> AuthResult<Uuid> {
        let user = self.authenticate(username, password).await?;
        let token = Uuid::new_v4();
        self.sessions.write().await.insert(token, user.username.clone());
        info!(user = %username, "logged in");
        Ok(token)
    }

    pub async fn logout(&self, token: Uuid) -> bool {
        self.sessions.write().await.remove(&token).is_some()
    }

    pub async fn session_user(&self, token: Uuid) -> AuthResult<String> {
        self.sessions
            .read()
            .await
            .get(&token)
            .cloned()
            .ok_or(AuthError::InvalidSession)
    }

    pub async fn create_user(&self, username: &str, password: &str, role: Role) -> AuthResult<()> {
        validate_username(username)?;
        validate_password(password)?;

        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash: hash_password(password)?,
                role,
            },
        );
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> AuthResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get(username)
            .ok_or_else(|| AuthError::UserNotFound(username.to_string()))?;
        if user.is_admin() && users.values().filter(|u| u.is_admin()).count() <= 1 {
            return Err(AuthError::LastAdmin);
        }
        users.remove(username);
        drop(users);

        self.sessions.write().await.retain(|_, owner| owner != username);
        Ok(())
    }

    pub async fn update_password(&self, username: &str, new_password: &str) -> AuthResult<()> {
        validate_password(new_password)?;
        let password_hash = hash_password(new_password)?;

        let mut users = self.users.write().await;
        let user = users
            .get_mut(username)
            .ok_or_else(|| AuthError::UserNotFound(username.to_string()))?;
        user.password_hash = password_hash;
        Ok(())
    }

    pub async fn list_users(&self) -> Vec<String> {
        let mut usernames: Vec<String> = self.users.read().await.keys().cloned().collect();
        usernames.sort();
        usernames
    }
}

fn hash_password(password: &str) -> AuthResult<String> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

fn validate_username(username: &str) -> AuthResult<()> {
    if username.is_empty() {
        return Err(AuthError::InvalidInput("username cannot be empty".into()));
    }
    if username.len() > 50 {
        return Err(AuthError::InvalidInput("username too long (max 50 characters)".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> AuthResult<()> {
    if password.len() < 8 {
        return Err(AuthError::InvalidInput("password must be at least 8 characters long".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_login_opens_session() {
        let auth = AuthManager::with_admin("admin", "adminpass").unwrap();
        let token = auth.login("admin", "adminpass").await.unwrap();
        assert_eq!(auth.session_user(token).await.unwrap(), "admin");

        assert!(auth.logout(token).await);
        assert!(matches!(auth.session_user(token).await, Err(AuthError::InvalidSession)));
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let auth = AuthManager::with_admin("admin", "adminpass").unwrap();
        assert!(matches!(auth.login("admin", "wrongpass").await, Err(AuthError::InvalidCredentials)));
        assert!(matches!(auth.login("nobody", "adminpass").await, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let auth = AuthManager::with_admin("admin", "adminpass").unwrap();
        auth.create_user("alice", "password123", Role::Experimenter).await.unwrap();
        assert!(matches!(
            auth.create_user("alice", "password123", Role::Experimenter).await,
            Err(AuthError::UserExists(_))
        ));
        assert!(matches!(
            auth.create_user("bob", "short", Role::Experimenter).await,
            Err(AuthError::InvalidInput(_))
        ));

        auth.update_password("alice", "newpassword").await.unwrap();
        assert!(auth.authenticate("alice", "password123").await.is_err());
        assert!(!auth.authenticate("alice", "newpassword").await.unwrap().is_admin());

        auth.delete_user("alice").await.unwrap();
        assert_eq!(auth.list_users().await, vec!["admin".to_string()]);
    }

    #[tokio::test]
    async fn test_last_admin_kept() {
        let auth = AuthManager::with_admin("admin", "adminpass").unwrap();
        assert!(matches!(auth.delete_user("admin").await, Err(AuthError::LastAdmin)));
    }
}
