//! Protocol-wide constants and shared-object naming.
//!
//! Every named OS object (metadata segment, writer mutex, active-consumer
//! segment) derives its name from the crate version and the metadata record
//! size, so a producer and a consumer built from incompatible versions simply
//! never find each other instead of misreading each other's memory.

use once_cell::sync::Lazy;

/// Number of texture/fence slot pairs the writer rotates through.
pub const SWAPCHAIN_LENGTH: usize = 2;

/// Upper bound on layers in a single frame.
pub const MAX_LAYERS: usize = 16;

/// Bounded retries for the lock-free metadata read before reporting a
/// transient empty result.
pub const SEQLOCK_MAX_RETRIES: usize = 8;

/// Pixel format of the shared texture: DXGI_FORMAT_B8G8R8A8_UNORM.
pub const SHARED_TEXTURE_DXGI_FORMAT: u32 = 87;

/// The shared texture carries premultiplied alpha.
pub const SHARED_TEXTURE_IS_PREMULTIPLIED: bool = true;

pub fn app_name() -> String {
    String::from("kneecast")
}

pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Name of the metadata segment.
///
/// `Local\` namespace: visible within the current session without
/// administrator rights, which is all a same-machine frame exchange needs.
pub fn shm_path() -> &'static str {
    static CACHE: Lazy<String> = Lazy::new(|| {
        format!(
            "Local\\{}/v{}-s{:x}",
            app_name(),
            app_version(),
            core::mem::size_of::<crate::shm::FrameMetadata>(),
        )
    });
    &CACHE
}

/// Name of the mutex guarding writer-side publishes.
pub fn mutex_path() -> &'static str {
    static CACHE: Lazy<String> = Lazy::new(|| format!("{}.mutex", shm_path()));
    &CACHE
}

/// Name of the active-consumer bookkeeping segment.
pub fn consumers_path() -> &'static str {
    static CACHE: Lazy<String> = Lazy::new(|| format!("{}.consumers", shm_path()));
    &CACHE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_version_scoped() {
        assert!(shm_path().starts_with("Local\\kneecast/v"));
        assert!(mutex_path().ends_with(".mutex"));
        assert!(consumers_path().ends_with(".consumers"));
        // Record size is baked into the name, so layout changes break the
        // rendezvous instead of the readers.
        assert!(shm_path().contains("-s"));
    }
}
