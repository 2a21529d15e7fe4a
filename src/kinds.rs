//! Event kinds used on the wire.

/// Remote signing (NIP-46) request/reply traffic.
pub const KIND_NIP46: u32 = 24133;

/// Service announcement carrying an attestation.
pub const KIND_ANNOUNCEMENT: u32 = 13793;

/// Enclaved container announcement.
pub const KIND_ENCLAVED_PROCESS: u32 = 63797;

/// RPC channel of attested key-storage services.
pub const KIND_KEYCRUX_RPC: u32 = 29525;
