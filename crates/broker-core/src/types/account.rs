//! Broker accounts and the ordered store that selects the active one.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A broker account: an identifier plus the API token used to authorize it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    token: String,
    #[serde(default)]
    pub selected: bool,
}

impl Account {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            selected: false,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("selected", &self.selected)
            .finish()
    }
}

/// Ordered account entries. Exactly one entry is active at any time; the
/// first entry is active when the store is built.
#[derive(Debug, Clone)]
pub struct AccountStore {
    accounts: Vec<Account>,
    active: usize,
}

impl AccountStore {
    /// Build a store from `(id, token)` pairs in file order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut accounts: Vec<Account> = Vec::new();
        for (id, token) in pairs {
            let account = Account::new(id, token);
            if account.id.trim().is_empty() || account.token.trim().is_empty() {
                return Err(Error::Config {
                    message: "account entries need both a name and a token".to_string(),
                });
            }
            if accounts.iter().any(|a| a.id == account.id) {
                return Err(Error::Config {
                    message: format!("duplicate account '{}'", account.id),
                });
            }
            accounts.push(account);
        }

        if accounts.is_empty() {
            return Err(Error::Config {
                message: "no accounts configured".to_string(),
            });
        }

        accounts[0].selected = true;
        Ok(Self {
            accounts,
            active: 0,
        })
    }

    /// The currently selected account.
    pub fn active(&self) -> &Account {
        &self.accounts[self.active]
    }

    /// Select a different account by id.
    pub fn select(&mut self, id: &str) -> Result<&Account> {
        let index = self
            .accounts
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;

        for (i, account) in self.accounts.iter_mut().enumerate() {
            account.selected = i == index;
        }
        self.active = index;
        Ok(&self.accounts[index])
    }

    pub fn ids(&self) -> Vec<&str> {
        self.accounts.iter().map(|a| a.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_entry_is_active() {
        let store = AccountStore::from_pairs(vec![("demo", "tok-a"), ("real", "tok-b")]).unwrap();
        assert_eq!(store.active().id, "demo");
        assert!(store.active().selected);
        assert_eq!(store.ids(), vec!["demo", "real"]);
    }

    #[test]
    fn test_select_switches_exactly_one() {
        let mut store =
            AccountStore::from_pairs(vec![("demo", "tok-a"), ("real", "tok-b")]).unwrap();
        let selected = store.select("real").unwrap();
        assert_eq!(selected.token(), "tok-b");
        assert_eq!(store.active().id, "real");

        let selected_count = store.accounts.iter().filter(|a| a.selected).count();
        assert_eq!(selected_count, 1);
    }

    #[test]
    fn test_select_unknown_account() {
        let mut store = AccountStore::from_pairs(vec![("demo", "tok-a")]).unwrap();
        assert!(matches!(
            store.select("missing"),
            Err(Error::AccountNotFound(id)) if id == "missing"
        ));
        assert_eq!(store.active().id, "demo");
    }

    #[test]
    fn test_rejects_empty_and_duplicate_entries() {
        let empty: Vec<(String, String)> = Vec::new();
        assert!(AccountStore::from_pairs(empty).is_err());
        assert!(AccountStore::from_pairs(vec![("a", "x"), ("a", "y")]).is_err());
        assert!(AccountStore::from_pairs(vec![("a", " ")]).is_err());
    }

    #[test]
    fn test_debug_does_not_expose_token() {
        let account = Account::new("demo", "a1-secret-token");
        let debug_str = format!("{:?}", account);
        assert!(!debug_str.contains("a1-secret-token"));
        assert!(debug_str.contains("demo"));
    }
}
