//! The server parameter map: DH group and accepted algorithm lists.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::{encoding, CryptoError, DhParams, MacAlgorithm, SeaSpec};
use crate::error::ServiceError;

use super::store::MailboxStore;

const DH_P: &str = "dhP";
const DH_G: &str = "dhG";
const DH_KEY_SIZE: &str = "dhKeySize";
const SEA_SPECS: &str = "seaSpecs";
const MAC_SPECS: &str = "macSpecs";

/// Parameters published by the `params` route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerParams {
    /// Base64 big-endian prime.
    pub dh_p: String,
    /// Base64 big-endian generator.
    pub dh_g: String,
    pub dh_key_size: u32,
    pub sea_specs: Vec<String>,
    pub mac_specs: Vec<String>,
}

impl ServerParams {
    /// Load the stored DH group or create one with `generate`, then record the
    /// configured algorithm lists.
    ///
    /// The group is generated only on the first start against a database;
    /// later starts reuse it.
    pub fn bootstrap<F>(
        store: &MailboxStore,
        sea_specs: &[String],
        mac_specs: &[String],
        generate: F,
    ) -> Result<Self, ServiceError>
    where
        F: FnOnce() -> Result<DhParams, CryptoError>,
    {
        let stored = store.params()?;
        let (dh_p, dh_g) = match (stored.get(DH_P), stored.get(DH_G)) {
            (Some(p), Some(g)) => {
                info!("Reusing stored DH parameters");
                (p.clone(), g.clone())
            }
            _ => {
                info!("Generating DH parameters");
                let params = generate()?;
                (
                    encoding::encode(&params.p_bytes()),
                    encoding::encode(&params.g_bytes()),
                )
            }
        };
        let dh_key_size = DhParams::from_encoded(&dh_p, &dh_g)?.key_size() as u32;

        let params = Self {
            dh_p,
            dh_g,
            dh_key_size,
            sea_specs: sea_specs.to_vec(),
            mac_specs: mac_specs.to_vec(),
        };
        store.put_params(&params.to_entries())?;
        Ok(params)
    }

    fn to_entries(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (DH_P.to_string(), self.dh_p.clone()),
            (DH_G.to_string(), self.dh_g.clone()),
            (DH_KEY_SIZE.to_string(), self.dh_key_size.to_string()),
            (SEA_SPECS.to_string(), self.sea_specs.join(",")),
            (MAC_SPECS.to_string(), self.mac_specs.join(",")),
        ])
    }

    pub fn dh_params(&self) -> Result<DhParams, CryptoError> {
        DhParams::from_encoded(&self.dh_p, &self.dh_g)
    }

    /// The spec is both listed and understood.
    pub fn accepts_sea_spec(&self, spec: &str) -> bool {
        self.sea_specs.iter().any(|s| s == spec) && spec.parse::<SeaSpec>().is_ok()
    }

    pub fn accepts_mac_spec(&self, spec: &str) -> bool {
        self.mac_specs.iter().any(|s| s == spec) && spec.parse::<MacAlgorithm>().is_ok()
    }
}
