mod raw {
    // The constants generated by `built`. See https://docs.rs/built/latest/built/index.html
    // for the full list. We only read a few of them.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as 0.1.0
pub const GENCON_PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const GENCON_FEATURES: &str = raw::FEATURES_STR;

/// `release` or `debug`
pub const GENCON_PROFILE: &str = raw::PROFILE;

lazy_static! {
    /// A one-line description of this build, logged when a collector is created.
    pub static ref GENCON_BUILD_DESCRIPTION: String = format!(
        "gencon {} ({} build, target {}, features: [{}])",
        GENCON_PKG_VERSION,
        GENCON_PROFILE,
        raw::TARGET,
        GENCON_FEATURES
    );
}
