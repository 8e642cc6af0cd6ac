pub mod fingerprint;
pub mod normalize;

pub use fingerprint::fingerprint;
pub use normalize::{canonical_path, normalize};
