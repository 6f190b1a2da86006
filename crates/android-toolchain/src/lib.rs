//! Android SDK tool wrappers
//!
//! Thin async wrappers over the Java based SDK command line tools:
//! - `sdkmanager` (package listing, install, licenses)
//! - `avdmanager` (virtual device creation and removal)

pub mod avd_manager;
pub mod error;
pub mod sdk_manager;

pub use avd_manager::{AvdCreateOptions, AvdManager};
pub use error::{Result, SdkToolError};
pub use sdk_manager::{SdkComponent, SdkLicense, SdkManager, SdkPackage, SdkPackageList, SdkUpdate};
