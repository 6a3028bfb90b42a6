//! Feature construction and price forecasting.
//!
//! [`FeatureBuilder`] turns raw OHLCV snapshots into normalized rolling
//! windows; [`Forecaster`] consumes those windows and produces a short-horizon
//! return estimate with an uncertainty measure the policy can discount.

pub mod features;
pub mod forecaster;

pub use features::{FeatureBuilder, FeatureOutcome, FEATURE_DIMS};
pub use forecaster::{Forecaster, ForecasterConfig, ForecasterSnapshot};
