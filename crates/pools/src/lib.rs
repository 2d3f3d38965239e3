//! Pool admission: defaulting and validation of pool specs, pool
//! resolution by name, the device selector engine, and the admission
//! webhook server.

pub mod admission;
pub mod defaults;
pub mod resolve;
pub mod selector;
pub mod validate;
pub mod webhook;

pub use admission::{review_device, PoolSource, Verdict};
pub use defaults::apply_defaults;
pub use resolve::{KubePoolSource, PoolResolution};
pub use selector::device_matches;
pub use validate::{validate_pool, ValidationErrors};
