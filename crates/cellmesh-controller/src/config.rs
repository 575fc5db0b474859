//! Runtime mesh settings loaded from the system namespace

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use tracing::{info, warn};

use cellmesh_common::crypto::PrivateKey;
use cellmesh_common::Error;

/// Gateway image used when the config map does not name one
pub const DEFAULT_GATEWAY_IMAGE: &str = "cellery/cell-gateway:latest";
/// Token service image used when the config map does not name one
pub const DEFAULT_TOKEN_SERVICE_IMAGE: &str = "cellery/cell-sts:latest";
/// Key of the private key in the operator Secret
pub const PRIVATE_KEY_SECRET_KEY: &str = "private-key";

const KEY_GATEWAY_IMAGE: &str = "gatewayImage";
const KEY_TOKEN_SERVICE_IMAGE: &str = "tokenServiceImage";
const KEY_CLUSTER_INGRESS_CLASS: &str = "clusterIngressClass";

/// Settings shared by every reconciler
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Image of the cell gateway
    pub gateway_image: String,
    /// Image of the token service
    pub token_service_image: String,
    /// Ingress class for cluster ingresses; cluster default when unset
    pub cluster_ingress_class: Option<String>,
    /// Key opening `enc:` payloads; they are rejected without one
    pub private_key: Option<Arc<PrivateKey>>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            gateway_image: DEFAULT_GATEWAY_IMAGE.to_string(),
            token_service_image: DEFAULT_TOKEN_SERVICE_IMAGE.to_string(),
            cluster_ingress_class: None,
            private_key: None,
        }
    }
}

impl MeshConfig {
    /// Settings from config map data; empty or missing keys keep defaults
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let value = |key: &str| {
            data.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Self {
            gateway_image: value(KEY_GATEWAY_IMAGE).unwrap_or(defaults.gateway_image),
            token_service_image: value(KEY_TOKEN_SERVICE_IMAGE)
                .unwrap_or(defaults.token_service_image),
            cluster_ingress_class: value(KEY_CLUSTER_INGRESS_CLASS),
            private_key: None,
        }
    }

    /// Attach the decryption key
    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = Some(Arc::new(key));
        self
    }

    /// Parse the key stored in the operator Secret
    ///
    /// Accepts the raw 32-byte scalar or its base64 text.
    pub fn parse_private_key(bytes: &[u8]) -> Result<PrivateKey, Error> {
        if bytes.len() == 32 {
            return PrivateKey::from_bytes(bytes);
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::config("mesh-config", "private key is neither raw nor base64"))?;
        PrivateKey::from_base64(text)
    }

    /// Load settings from `namespace`
    ///
    /// A missing config map keeps the defaults and a missing secret leaves
    /// decryption disabled; an unreadable key is an error.
    pub async fn load(
        client: &Client,
        namespace: &str,
        config_map: &str,
        secret: &str,
    ) -> Result<Self, Error> {
        let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let mut config = match config_maps.get_opt(config_map).await? {
            Some(cm) => Self::from_data(&cm.data.unwrap_or_default()),
            None => {
                warn!(%namespace, config_map, "mesh config map not found, using defaults");
                Self::default()
            }
        };

        let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
        let key = secrets
            .get_opt(secret)
            .await?
            .and_then(|s| s.data)
            .and_then(|mut data| data.remove(PRIVATE_KEY_SECRET_KEY));
        match key {
            Some(bytes) => config = config.with_private_key(Self::parse_private_key(&bytes.0)?),
            None => warn!(
                %namespace,
                secret,
                "private key not found; encrypted payloads will be rejected"
            ),
        }

        info!(
            gateway_image = %config.gateway_image,
            token_service_image = %config.token_service_image,
            cluster_ingress_class = ?config.cluster_ingress_class,
            decryption = config.private_key.is_some(),
            "loaded mesh config"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn data_overrides_defaults() {
        let data = BTreeMap::from([
            (KEY_GATEWAY_IMAGE.to_string(), "registry/gw:2".to_string()),
            (KEY_TOKEN_SERVICE_IMAGE.to_string(), "  ".to_string()),
            (KEY_CLUSTER_INGRESS_CLASS.to_string(), "nginx".to_string()),
        ]);
        let config = MeshConfig::from_data(&data);
        assert_eq!(config.gateway_image, "registry/gw:2");
        assert_eq!(config.token_service_image, DEFAULT_TOKEN_SERVICE_IMAGE);
        assert_eq!(config.cluster_ingress_class.as_deref(), Some("nginx"));
        assert!(config.private_key.is_none());
    }

    #[test]
    fn private_key_accepts_raw_and_base64() {
        let mut raw = [0u8; 32];
        raw[31] = 7;
        let from_raw = MeshConfig::parse_private_key(&raw).unwrap();
        let from_b64 = MeshConfig::parse_private_key(STANDARD.encode(raw).as_bytes()).unwrap();
        assert_eq!(from_raw.public_key(), from_b64.public_key());

        assert!(MeshConfig::parse_private_key(b"garbage").is_err());
    }
}
