use tracing::{info, warn};

use crate::database::models::{AccountId, CategoryId};
use crate::database::repo::ImageStore;
use crate::error::IngestError;
use crate::ml::classifier::CATCH_ALL_CATEGORY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCategory {
    pub id: CategoryId,
    pub name: String,
    /// True when the label had no visible match and the catch-all was used.
    pub fell_back: bool,
}

/// Maps a classification label to a category the account can see, falling
/// back to the global catch-all.
#[derive(Debug, Clone)]
pub struct CategoryResolver {
    catch_all: String,
}

impl Default for CategoryResolver {
    fn default() -> Self {
        Self { catch_all: CATCH_ALL_CATEGORY.to_string() }
    }
}

impl CategoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A missing catch-all is a misconfigured store, never a per-request
    /// condition, so it surfaces as `IngestError::Configuration`.
    pub fn resolve(
        &self,
        store: &ImageStore,
        label: &str,
        account: AccountId,
    ) -> Result<ResolvedCategory, IngestError> {
        if let Some(found) = store.find_visible_category(label, account)? {
            return Ok(ResolvedCategory { id: found.id, name: found.name, fell_back: false });
        }

        match store.find_global_category(&self.catch_all)? {
            Some(other) => {
                info!(label, account_id = account, "No visible category for label, using '{}'", other.name);
                Ok(ResolvedCategory { id: other.id, name: other.name, fell_back: true })
            }
            None => {
                warn!(label, account_id = account, "Catch-all category '{}' is missing", self.catch_all);
                Err(IngestError::Configuration(self.catch_all.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repo::tests::temp_database;

    #[test]
    fn test_exact_visible_match_wins() {
        let (_dir, db) = temp_database();
        let store = db.open().unwrap();
        store.insert_category("other", None).unwrap();
        let animal = store.insert_category("animal", None).unwrap();
        let mine = store.insert_category("receipts", Some(3)).unwrap();

        let resolver = CategoryResolver::new();
        let r = resolver.resolve(&store, "animal", 3).unwrap();
        assert_eq!((r.id, r.fell_back), (animal, false));

        let r = resolver.resolve(&store, "receipts", 3).unwrap();
        assert_eq!((r.id, r.name.as_str(), r.fell_back), (mine, "receipts", false));
    }

    #[test]
    fn test_unknown_or_foreign_label_falls_back() {
        let (_dir, db) = temp_database();
        let store = db.open().unwrap();
        let other = store.insert_category("other", None).unwrap();
        store.insert_category("receipts", Some(4)).unwrap();

        let resolver = CategoryResolver::new();
        for label in ["spaceships", "receipts", "Animal", ""] {
            let r = resolver.resolve(&store, label, 3).unwrap();
            assert_eq!(r, ResolvedCategory { id: other, name: "other".into(), fell_back: true });
        }
    }

    #[test]
    fn test_account_scoped_other_is_not_a_catch_all() {
        let (_dir, db) = temp_database();
        let store = db.open().unwrap();
        store.insert_category("other", Some(3)).unwrap();

        let resolver = CategoryResolver::new();
        // Visible by exact name, but it cannot serve as the fallback for unknown labels.
        assert!(!resolver.resolve(&store, "other", 3).unwrap().fell_back);
        let err = resolver.resolve(&store, "spaceships", 3).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(ref name) if name == "other"));
    }
}
