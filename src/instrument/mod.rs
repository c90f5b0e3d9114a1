//! Instruments of the FMR rig.
//!
//! [`capabilities`] defines the traits the campaign depends on. The other
//! modules are command wrappers for specific instruments, the VSM magnet
//! driver with its hex-word codec, and simulated devices.

pub mod ac_source;
pub mod capabilities;
pub mod hex_codec;
pub mod lockin;
pub mod mock;
pub mod rf_source;
pub mod rig;
pub mod vsm_magnet;

#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use ac_source::AcSource;
pub use capabilities::{FieldControl, ScpiEndpoint, TemperatureControl};
pub use lockin::{LockIn, LockInStatus};
pub use rf_source::RfSource;
pub use rig::{Rig, RigStatus};
pub use vsm_magnet::VsmMagnet;

use crate::config::InstrumentConfig;
use crate::error::AppResult;

/// Identity strings of the lock-in, RF source and AC source.
#[cfg(feature = "instrument_visa")]
pub async fn identify_all(instruments: &InstrumentConfig) -> AppResult<Vec<(String, String)>> {
    use crate::error::HardwareContext;

    let mut identities = Vec::new();
    for resource in [
        &instruments.lockin,
        &instruments.rf_source,
        &instruments.ac_source,
    ] {
        let endpoint = visa::VisaEndpoint::open(resource)
            .await
            .hardware("opening VISA resource")?;
        let identity = endpoint
            .identify()
            .await
            .hardware("querying instrument identity")?;
        identities.push((resource.clone(), identity));
    }
    Ok(identities)
}

#[cfg(not(feature = "instrument_visa"))]
pub async fn identify_all(_instruments: &InstrumentConfig) -> AppResult<Vec<(String, String)>> {
    Err(crate::error::DaqError::FeatureNotEnabled(
        "instrument_visa".to_string(),
    ))
}
