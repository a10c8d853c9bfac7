use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::Deserialize;
use ulid::Ulid;

/// An authenticated advisor, as handed to the session after hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisorIdentity {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AdvisorRecord {
    id: Ulid,
    name: String,
    email: String,
    password: String,
}

/// The set of advisors allowed to open authenticated sessions. Loaded once
/// at startup from a JSON file, or built as a single-advisor registry from
/// an environment password.
pub struct AdvisorRegistry {
    by_name: HashMap<String, AdvisorRecord>,
    by_id: HashMap<Ulid, AdvisorRecord>,
}

impl AdvisorRegistry {
    fn from_records(records: Vec<AdvisorRecord>) -> Self {
        let by_name = records
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        let by_id = records.into_iter().map(|r| (r.id, r)).collect();
        Self { by_name, by_id }
    }

    /// Load a JSON array of `{id, name, email, password}` records.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<AdvisorRecord> = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_records(records))
    }

    /// Single-advisor fallback for simple deployments: one advisor named
    /// "advisor" with a fixed id, guarded by the given password.
    pub fn single(email: String, password: String) -> Self {
        Self::from_records(vec![AdvisorRecord {
            id: Ulid::from(1u128),
            name: "advisor".to_string(),
            email,
            password,
        }])
    }

    /// Check credentials; a match yields the advisor's identity.
    pub fn verify(&self, name: &str, password: &str) -> Option<AdvisorIdentity> {
        let record = self.by_name.get(name)?;
        if record.password != password {
            return None;
        }
        Some(AdvisorIdentity {
            id: record.id,
            name: record.name.clone(),
            email: record.email.clone(),
        })
    }

    pub fn by_id(&self, id: &Ulid) -> Option<AdvisorIdentity> {
        self.by_id.get(id).map(|r| AdvisorIdentity {
            id: r.id,
            name: r.name.clone(),
            email: r.email.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_credentials() {
        let reg = AdvisorRegistry::single("a@school.edu".into(), "hunter2".into());
        let identity = reg.verify("advisor", "hunter2").unwrap();
        assert_eq!(identity.email, "a@school.edu");
        assert!(reg.verify("advisor", "wrong").is_none());
        assert!(reg.verify("nobody", "hunter2").is_none());
    }

    #[test]
    fn by_id_resolves_registered_advisor() {
        let reg = AdvisorRegistry::single("a@school.edu".into(), "pw".into());
        let identity = reg.verify("advisor", "pw").unwrap();
        assert_eq!(reg.by_id(&identity.id).unwrap().name, "advisor");
        assert!(reg.by_id(&Ulid::new()).is_none());
    }

    #[test]
    fn loads_registry_file() {
        let dir = std::env::temp_dir().join("slotbook_test_auth");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("advisors.json");
        std::fs::write(
            &path,
            r#"[{"id":"01ARZ3NDEKTSV4RRFFQ69G5FAV","name":"taylor","email":"t@school.edu","password":"pw"}]"#,
        )
        .unwrap();

        let reg = AdvisorRegistry::from_file(&path).unwrap();
        assert!(reg.verify("taylor", "pw").is_some());

        let _ = std::fs::remove_file(&path);
    }
}
