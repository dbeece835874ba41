//! In-memory image registry keyed by path-like [`ImageKey`]s.
//!
//! The registry is append-only: the first write for a key wins and later
//! writes are ignored. Nothing is evicted; callers that read must cope with
//! a key that has not been registered (yet).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::imaging;
use crate::types::{DreamId, DreamImageId};

/// Path prefix under which registered images are served.
pub const IMAGE_URI_PREFIX: &str = "/images/";

/// Every served image is PNG.
pub const IMAGE_URI_SUFFIX: &str = ".png";

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Slash-separated key such as `dreams/<dream>/<image>/<variant>`.
///
/// Segments are non-empty and limited to `[A-Za-z0-9_-]`, which keeps
/// the mapping to and from `/images/<key>.png` bijective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageKey(String);

impl ImageKey {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let valid = !raw.is_empty()
            && raw.split('/').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            });

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(CoreError::Validation(format!("invalid image key '{raw}'")))
        }
    }

    /// A fresh key for one payload (preview or final) of a dream image.
    pub fn for_image(dream_id: DreamId, image_id: DreamImageId) -> Self {
        Self(format!("dreams/{dream_id}/{image_id}/{}", Uuid::now_v7()))
    }

    pub fn base_image(dream_id: DreamId) -> Self {
        Self(format!("dreams/{dream_id}/base"))
    }

    pub fn base_image_mask(dream_id: DreamId) -> Self {
        Self(format!("dreams/{dream_id}/mask"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The request path this key is served under.
    pub fn uri(&self) -> String {
        format!("{IMAGE_URI_PREFIX}{}{IMAGE_URI_SUFFIX}", self.0)
    }

    /// Inverse of [`ImageKey::uri`].
    pub fn from_uri_path(path: &str) -> Result<Self, CoreError> {
        let inner = path
            .strip_prefix(IMAGE_URI_PREFIX)
            .and_then(|rest| rest.strip_suffix(IMAGE_URI_SUFFIX))
            .ok_or_else(|| CoreError::Validation(format!("not an image path: '{path}'")))?;
        Self::parse(inner)
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageKey> for String {
    fn from(value: ImageKey) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Encoded image bytes plus the dimensions read from their header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RegisteredImage {
    /// Wrap encoded bytes, rejecting anything whose header cannot be read.
    pub fn from_encoded(bytes: Vec<u8>) -> Result<Self, image::ImageError> {
        let (width, height) = imaging::dimensions(&bytes)?;
        Ok(Self {
            bytes,
            width,
            height,
        })
    }
}

#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: RwLock<HashMap<ImageKey, Arc<RegisteredImage>>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `image` under `key` unless the key is already taken.
    ///
    /// Returns `true` if this call inserted the image.
    pub fn register(&self, key: ImageKey, image: RegisteredImage) -> bool {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        if images.contains_key(&key) {
            return false;
        }
        images.insert(key, Arc::new(image));
        true
    }

    pub fn get(&self, key: &ImageKey) -> Result<Arc<RegisteredImage>, CoreError> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                entity: "image",
                id: key.to_string(),
            })
    }

    pub fn contains(&self, key: &ImageKey) -> bool {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.images.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
