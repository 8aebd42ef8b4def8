use std::collections::HashMap;

use async_trait::async_trait;

use crate::CertificateMaterial;

/// Picks certificate material for a connection from its SNI server name.
///
/// Called between the two handshake phases, only when the client sent a
/// server name. Returning `None` falls back to the listener's static
/// material. Implementations may suspend; no timeout is applied.
#[async_trait]
pub trait CertificateResolver: Send + Sync {
    async fn resolve(&self, server_name: &str) -> Option<CertificateMaterial>;
}

/// A resolver backed by a server name to material map.
///
/// Lookups are case insensitive. An exact entry wins over a `*.` wildcard
/// entry, and a wildcard covers exactly one leading label.
#[derive(Debug, Clone, Default)]
pub struct SniMap {
    entries: HashMap<String, CertificateMaterial>,
}

impl SniMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server_name: &str, material: CertificateMaterial) -> Option<CertificateMaterial> {
        self.entries.insert(normalize(server_name), material)
    }

    pub fn get(&self, server_name: &str) -> Option<&CertificateMaterial> {
        let server_name = normalize(server_name);
        if let Some(material) = self.entries.get(&server_name) {
            return Some(material);
        }

        let (_, parent) = server_name.split_once('.')?;
        if parent.is_empty() {
            return None;
        }
        self.entries.get(&format!("*.{parent}"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, CertificateMaterial)> for SniMap {
    fn from_iter<T: IntoIterator<Item = (String, CertificateMaterial)>>(iter: T) -> Self {
        let mut map = SniMap::new();
        for (name, material) in iter {
            map.insert(&name, material);
        }
        map
    }
}

#[async_trait]
impl CertificateResolver for SniMap {
    async fn resolve(&self, server_name: &str) -> Option<CertificateMaterial> {
        self.get(server_name).cloned()
    }
}

fn normalize(server_name: &str) -> String {
    server_name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> CertificateMaterial {
        CertificateMaterial::from_pem(
            include_bytes!("../tests/fixtures/ec_leaf.pem"),
            include_bytes!("../tests/fixtures/ec_leaf.key"),
        )
        .unwrap()
    }

    fn rsa_material() -> CertificateMaterial {
        CertificateMaterial::from_pem(include_bytes!("../tests/fixtures/leaf.pem"), include_bytes!("../tests/fixtures/leaf.key"))
            .unwrap()
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let mut map = SniMap::new();
        map.insert("Host.Example", material());

        assert!(map.get("host.example").is_some());
        assert!(map.get("HOST.EXAMPLE.").is_some());
        assert!(map.get("other.example").is_none());
    }

    #[test]
    fn wildcard_covers_one_label() {
        let map: SniMap = [("*.example.com".to_string(), material())].into_iter().collect();

        assert!(map.get("a.example.com").is_some());
        assert!(map.get("example.com").is_none());
        assert!(map.get("a.b.example.com").is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn exact_entry_wins_over_wildcard() {
        let exact = material();
        let exact_certificate = exact.certificate_chain()[0].clone();

        let mut map = SniMap::new();
        map.insert("*.example.com", rsa_material());
        map.insert("www.example.com", exact);

        assert_eq!(map.get("www.example.com").unwrap().certificate_chain()[0], exact_certificate);
        assert_ne!(map.get("api.example.com").unwrap().certificate_chain()[0], exact_certificate);
    }

    #[tokio::test]
    async fn resolves_through_the_trait() {
        let mut map = SniMap::new();
        map.insert("host.example", material());
        let resolver: &dyn CertificateResolver = &map;

        assert!(resolver.resolve("host.example").await.is_some());
        assert!(resolver.resolve("nobody.example").await.is_none());
    }
}
