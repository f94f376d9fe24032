// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bit-packed platform specifiers.
//!
//! A platform identifier is a single `u64` built from six 8-bit fields,
//! each stored as `value + 1` so that zero always means "unspecified".
//! A packed value of `0` therefore matches any platform, and every nonzero
//! field narrows the match. Specialized changes and compiled artifacts are
//! selected by walking [`reduce`] from the requested platform toward `0`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// The "any platform" identifier.
pub const PLATFORM_ANY: u64 = 0;

/// Largest storable field value; `255` would collide with the +1 encoding.
pub const FIELD_MAX: u8 = 254;

const SHIFT_BASE: u32 = 0;
const SHIFT_ARCH: u32 = 8;
const SHIFT_RENDER_API_GROUP: u32 = 24;
const SHIFT_RENDER_API: u32 = 32;
const SHIFT_QUALITY: u32 = 48;
const SHIFT_CUSTOM: u32 = 56;

/// Field shifts ordered from most to least specific.
const SPECIFICITY: [u32; 6] = [
    SHIFT_CUSTOM,
    SHIFT_QUALITY,
    SHIFT_RENDER_API,
    SHIFT_RENDER_API_GROUP,
    SHIFT_ARCH,
    SHIFT_BASE,
];

/// Bits 16..23 and 40..47 are reserved and must be zero.
const RESERVED_MASK: u64 = (0xff << 16) | (0xff << 40);

/// Errors for platform pack/unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// A declaration field exceeds [`FIELD_MAX`].
    #[error("platform field value {0} exceeds {FIELD_MAX}")]
    FieldOutOfRange(u8),
    /// A packed value has nonzero bits in a reserved byte range.
    #[error("platform {0:#018x} has nonzero reserved bits")]
    ReservedBits(u64),
}

/// An unpacked platform declaration.
///
/// `None` means the field is unspecified; `Some(v)` narrows the platform to
/// that field value, `v` in `0..=254`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformSpec {
    /// Base platform (e.g. an operating-system family).
    pub base: Option<u8>,
    /// Processor architecture.
    pub arch: Option<u8>,
    /// Render API group.
    pub render_api_group: Option<u8>,
    /// Render API.
    pub render_api: Option<u8>,
    /// Quality level.
    pub quality: Option<u8>,
    /// Application-defined field, the most specific of all.
    pub custom: Option<u8>,
}

impl PlatformSpec {
    /// The fully-unspecified declaration, packing to [`PLATFORM_ANY`].
    pub const ANY: PlatformSpec = PlatformSpec {
        base: None,
        arch: None,
        render_api_group: None,
        render_api: None,
        quality: None,
        custom: None,
    };

    /// Pack into the `u64` identifier.
    pub fn pack(&self) -> Result<u64, PlatformError> {
        Ok(pack_field(self.base, SHIFT_BASE)?
            | pack_field(self.arch, SHIFT_ARCH)?
            | pack_field(self.render_api_group, SHIFT_RENDER_API_GROUP)?
            | pack_field(self.render_api, SHIFT_RENDER_API)?
            | pack_field(self.quality, SHIFT_QUALITY)?
            | pack_field(self.custom, SHIFT_CUSTOM)?)
    }

    /// Unpack a `u64` identifier.
    ///
    /// Nonzero bits in the reserved byte ranges (16..23 and 40..47) are
    /// rejected rather than silently dropped.
    pub fn unpack(platform: u64) -> Result<Self, PlatformError> {
        if platform & RESERVED_MASK != 0 {
            return Err(PlatformError::ReservedBits(platform));
        }
        Ok(Self {
            base: unpack_field(platform, SHIFT_BASE),
            arch: unpack_field(platform, SHIFT_ARCH),
            render_api_group: unpack_field(platform, SHIFT_RENDER_API_GROUP),
            render_api: unpack_field(platform, SHIFT_RENDER_API),
            quality: unpack_field(platform, SHIFT_QUALITY),
            custom: unpack_field(platform, SHIFT_CUSTOM),
        })
    }
}

fn pack_field(value: Option<u8>, shift: u32) -> Result<u64, PlatformError> {
    match value {
        None => Ok(0),
        Some(v) if v <= FIELD_MAX => Ok((u64::from(v) + 1) << shift),
        Some(v) => Err(PlatformError::FieldOutOfRange(v)),
    }
}

fn unpack_field(platform: u64, shift: u32) -> Option<u8> {
    let raw = (platform >> shift) & 0xff;
    if raw == 0 {
        None
    } else {
        Some((raw - 1) as u8)
    }
}

/// `true` when `test` is equal to or more specific than `reference`.
///
/// Holds iff, for every field, the reference leaves the field unspecified
/// or the test value equals it. A change stored at `reference` therefore
/// applies to any target `test` for which this returns `true`.
#[must_use]
pub fn equal_or_more_specific(test: u64, reference: u64) -> bool {
    for shift in SPECIFICITY {
        let r = (reference >> shift) & 0xff;
        if r != 0 && (test >> shift) & 0xff != r {
            return false;
        }
    }
    true
}

/// Step `current` one notch down the specificity order.
///
/// Clears the most specific field set in `current`; every field more
/// specific than the cleared one is re-folded from `full`. Iterating
/// `reduce(p, full)` from `full` enumerates candidate platforms from most
/// to least specific and terminates at [`PLATFORM_ANY`].
#[must_use]
pub fn reduce(current: u64, full: u64) -> u64 {
    for (idx, &shift) in SPECIFICITY.iter().enumerate() {
        if (current >> shift) & 0xff == 0 {
            continue;
        }
        let mut next = current & !(0xffu64 << shift);
        for &above in &SPECIFICITY[..idx] {
            let mask = 0xffu64 << above;
            next = (next & !mask) | (full & mask);
        }
        return next;
    }
    PLATFORM_ANY
}

/// All candidate platforms for a lookup at `platform`, most specific first,
/// ending with [`PLATFORM_ANY`].
#[must_use]
pub fn fallback_chain(platform: u64) -> Vec<u64> {
    let mut chain = vec![platform];
    let mut current = platform;
    while current != PLATFORM_ANY {
        current = reduce(current, platform);
        chain.push(current);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(
        base: i16,
        arch: i16,
        rag: i16,
        ra: i16,
        quality: i16,
        custom: i16,
    ) -> PlatformSpec {
        let f = |v: i16| if v < 0 { None } else { Some(v as u8) };
        PlatformSpec {
            base: f(base),
            arch: f(arch),
            render_api_group: f(rag),
            render_api: f(ra),
            quality: f(quality),
            custom: f(custom),
        }
    }

    #[test]
    fn any_packs_to_zero() {
        assert_eq!(PlatformSpec::ANY.pack().unwrap(), PLATFORM_ANY);
        assert_eq!(PlatformSpec::unpack(0).unwrap(), PlatformSpec::ANY);
    }

    #[test]
    fn field_offsets() {
        assert_eq!(spec(3, -1, -1, -1, -1, -1).pack().unwrap(), 4);
        assert_eq!(spec(-1, 0, -1, -1, -1, -1).pack().unwrap(), 1 << 8);
        assert_eq!(spec(-1, -1, 7, -1, -1, -1).pack().unwrap(), 8 << 24);
        assert_eq!(spec(-1, -1, -1, 7, -1, -1).pack().unwrap(), 8u64 << 32);
        assert_eq!(spec(-1, -1, -1, -1, 2, -1).pack().unwrap(), 3u64 << 48);
        assert_eq!(spec(-1, -1, -1, -1, -1, 9).pack().unwrap(), 10u64 << 56);
    }

    #[test]
    fn reserved_bits_rejected() {
        assert_eq!(
            PlatformSpec::unpack(1 << 16),
            Err(PlatformError::ReservedBits(1 << 16))
        );
        assert_eq!(
            PlatformSpec::unpack(1 << 40),
            Err(PlatformError::ReservedBits(1 << 40))
        );
    }

    #[test]
    fn out_of_range_field_rejected() {
        let bad = PlatformSpec {
            base: Some(255),
            ..PlatformSpec::ANY
        };
        assert_eq!(bad.pack(), Err(PlatformError::FieldOutOfRange(255)));
    }

    #[test]
    fn specificity_partial_order() {
        let any = PLATFORM_ANY;
        let base = spec(1, -1, -1, -1, -1, -1).pack().unwrap();
        let base_arch = spec(1, 2, -1, -1, -1, -1).pack().unwrap();
        let other_base = spec(2, 2, -1, -1, -1, -1).pack().unwrap();

        assert!(equal_or_more_specific(base, any));
        assert!(equal_or_more_specific(base_arch, base));
        assert!(equal_or_more_specific(base_arch, base_arch));
        assert!(!equal_or_more_specific(base, base_arch));
        assert!(!equal_or_more_specific(other_base, base));
    }

    #[test]
    fn reduce_clears_most_specific_first() {
        let full = spec(1, 2, -1, -1, 3, 4).pack().unwrap();
        let no_custom = spec(1, 2, -1, -1, 3, -1).pack().unwrap();
        let custom_only_quality_cleared = spec(1, 2, -1, -1, -1, 4).pack().unwrap();

        assert_eq!(reduce(full, full), no_custom);
        // Clearing quality folds custom back in from the full platform.
        assert_eq!(reduce(no_custom, full), custom_only_quality_cleared);
    }

    #[test]
    fn reduce_terminates_at_any() {
        let full = spec(1, 2, 3, 4, 5, 6).pack().unwrap();
        let chain = fallback_chain(full);
        assert_eq!(*chain.first().unwrap(), full);
        assert_eq!(*chain.last().unwrap(), PLATFORM_ANY);
        // Six independent fields: the walk visits every nonempty subset
        // once, then "any".
        assert_eq!(chain.len(), 64);
        // No candidate repeats.
        let mut sorted = chain.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), chain.len());
    }

    fn arb_field() -> impl Strategy<Value = Option<u8>> {
        prop_oneof![Just(None), (0u8..=FIELD_MAX).prop_map(Some)]
    }

    fn arb_spec() -> impl Strategy<Value = PlatformSpec> {
        (
            arb_field(),
            arb_field(),
            arb_field(),
            arb_field(),
            arb_field(),
            arb_field(),
        )
            .prop_map(|(base, arch, rag, ra, quality, custom)| PlatformSpec {
                base,
                arch,
                render_api_group: rag,
                render_api: ra,
                quality,
                custom,
            })
    }

    proptest! {
        #[test]
        fn pack_unpack_bijection(decl in arb_spec()) {
            let packed = decl.pack().unwrap();
            prop_assert_eq!(PlatformSpec::unpack(packed).unwrap(), decl);
        }

        #[test]
        fn reduce_walk_terminates(decl in arb_spec()) {
            let full = decl.pack().unwrap();
            let chain = fallback_chain(full);
            prop_assert!(chain.len() <= 64);
            prop_assert_eq!(*chain.last().unwrap(), PLATFORM_ANY);
            for candidate in chain {
                // Every candidate is a sub-specification of the target.
                prop_assert!(equal_or_more_specific(full, candidate));
            }
        }
    }
}
