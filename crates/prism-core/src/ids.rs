//! Typed handles into the render context tables.

use std::fmt;
use std::path::{Path, PathBuf};

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Index into the owning table.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

typed_id!(
    /// Handle to an uploaded mesh.
    MeshId
);
typed_id!(
    /// Handle to a registered material. Also its material-block index.
    MaterialId
);
typed_id!(
    /// Handle to a texture slot in the shared texture array.
    TextureId
);
typed_id!(
    /// Scene-graph identity of an object.
    ObjectId
);

/// Key of an imported environment: the source image path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnvironmentKey(PathBuf);

impl EnvironmentKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
