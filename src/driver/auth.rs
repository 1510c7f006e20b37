use crate::core::{Result, StoreError};
use std::collections::HashMap;
use std::sync::RwLock;

/// User account
#[derive(Debug, Clone)]
pub struct User {
    username: String,
    password_hash: String,
}

impl User {
    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Credential store for a database server
///
/// Passwords are kept as bcrypt hashes. Every failure to authenticate is
/// reported as `StoreError::Auth` with the same message, whether the user is
/// unknown or the password is wrong.
pub struct AuthManager {
    users: RwLock<HashMap<String, User>>,
    cost: u32,
}

impl AuthManager {
    /// Creates an empty manager hashing with bcrypt's default cost.
    pub fn new() -> Self {
        Self::with_cost(bcrypt::DEFAULT_COST)
    }

    /// Creates an empty manager with a custom bcrypt cost (4..=31).
    pub fn with_cost(cost: u32) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            cost: cost.clamp(4, 31),
        }
    }

    fn hash_password(&self, password: &str) -> Result<String> {
        bcrypt::hash(password, self.cost)
            .map_err(|e| StoreError::Auth(format!("Failed to hash password: {}", e)))
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        bcrypt::verify(password, hash).unwrap_or(false)
    }

    /// Verifies a username/password pair.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let users = self.users.read()?;

        let user = users
            .get(username)
            .ok_or_else(|| StoreError::Auth("Invalid username or password".into()))?;

        if !Self::verify_password(password, &user.password_hash) {
            return Err(StoreError::Auth("Invalid username or password".into()));
        }

        Ok(user.clone())
    }

    /// Creates a new user
    pub fn create_user(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            return Err(StoreError::Config("Username cannot be empty".into()));
        }
        if password.is_empty() {
            return Err(StoreError::Config("Password cannot be empty".into()));
        }

        let password_hash = self.hash_password(password)?;
        let mut users = self.users.write()?;

        if users.contains_key(username) {
            return Err(StoreError::Config(format!("User '{}' already exists", username)));
        }

        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash,
            },
        );

        Ok(())
    }

    /// Deletes a user; returns whether the user existed.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        let mut users = self.users.write()?;
        Ok(users.remove(username).is_some())
    }

    /// Replaces a user's password
    pub fn change_password(&self, username: &str, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(StoreError::Config("Password cannot be empty".into()));
        }
        let password_hash = self.hash_password(new_password)?;
        let mut users = self.users.write()?;
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::Config(format!("User '{}' not found", username)))?;
        user.password_hash = password_hash;
        Ok(())
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.users
            .read()
            .map(|users| users.contains_key(username))
            .unwrap_or(false)
    }

    pub fn user_count(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}
