//! # Internal Macros
//!
//! ## zerocopy_getters!
//!
//! On-disk structs hold multi-byte fields as zerocopy little-endian wrapper
//! types (`U16`/`U32`/`U64`). This macro generates native-typed getters so
//! call sites never see the wrappers. No setters are generated: headers are
//! rebuilt whole through their constructor on every write.
//!
//! ```ignore
//! impl NodeHeader {
//!     crate::zerocopy_getters! {
//!         size: u32,
//!         capacity: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn size(&self) -> u32 { self.size.get() }
//! // pub fn capacity(&self) -> u64 { self.capacity.get() }
//! ```

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $ty {
                self.$field.get()
            }
        )*
    };
}
