//! Message Trust Context: the cryptographic disposition of a decrypted
//! message, carried to handlers so they can gate on how the message
//! reached them.

use bitflags::bitflags;

use crate::error::{StaticAgentError, StaticAgentResult};

bitflags! {
    /// Individual trust contexts a message can affirm or deny.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u16 {
        const SIZE_OK = 1;
        const DESERIALIZE_OK = 1 << 1;
        const KEYS_OK = 1 << 2;
        const VALUES_OK = 1 << 3;
        const CONFIDENTIALITY = 1 << 4;
        const INTEGRITY = 1 << 5;
        const AUTHENTICATED_ORIGIN = 1 << 6;
        const NONREPUDIATION = 1 << 7;
        const LIMITED_SCOPE = 1 << 8;
        const PFS = 1 << 9;
    }
}

pub const AUTHCRYPT_AFFIRMED: ContextFlags = ContextFlags::CONFIDENTIALITY
    .union(ContextFlags::INTEGRITY)
    .union(ContextFlags::DESERIALIZE_OK)
    .union(ContextFlags::AUTHENTICATED_ORIGIN);
pub const AUTHCRYPT_DENIED: ContextFlags = ContextFlags::NONREPUDIATION;

pub const ANONCRYPT_AFFIRMED: ContextFlags = ContextFlags::CONFIDENTIALITY
    .union(ContextFlags::INTEGRITY)
    .union(ContextFlags::DESERIALIZE_OK);
pub const ANONCRYPT_DENIED: ContextFlags =
    ContextFlags::AUTHENTICATED_ORIGIN.union(ContextFlags::NONREPUDIATION);

pub const PLAINTEXT_AFFIRMED: ContextFlags = ContextFlags::DESERIALIZE_OK;
pub const PLAINTEXT_DENIED: ContextFlags = ContextFlags::CONFIDENTIALITY
    .union(ContextFlags::INTEGRITY)
    .union(ContextFlags::AUTHENTICATED_ORIGIN)
    .union(ContextFlags::NONREPUDIATION);

/// How the message was (or was not) protected on the wire, including the
/// key identities involved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Plaintext,
    Anoncrypt {
        recipient_vk: Vec<u8>,
    },
    Authcrypt {
        sender_vk: Vec<u8>,
        recipient_vk: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTrustContext {
    disposition: Disposition,
    affirmed: ContextFlags,
    denied: ContextFlags,
}

impl Default for MessageTrustContext {
    /// No context established yet: nothing affirmed, nothing denied.
    fn default() -> Self {
        Self {
            disposition: Disposition::Plaintext,
            affirmed: ContextFlags::empty(),
            denied: ContextFlags::empty(),
        }
    }
}

impl MessageTrustContext {
    /// Build a context from bare flag sets. Affirming and denying the same
    /// context is contradictory and rejected.
    pub fn with_flags(
        affirmed: ContextFlags,
        denied: ContextFlags,
    ) -> StaticAgentResult<Self> {
        if !(affirmed & denied).is_empty() {
            return Err(StaticAgentError::Configuration(format!(
                "contradictory trust context; affirmed and denied share {:?}",
                affirmed & denied,
            )));
        }
        Ok(Self {
            disposition: Disposition::Plaintext,
            affirmed,
            denied,
        })
    }

    pub fn plaintext() -> Self {
        Self {
            disposition: Disposition::Plaintext,
            affirmed: PLAINTEXT_AFFIRMED,
            denied: PLAINTEXT_DENIED,
        }
    }

    pub fn anoncrypted(recipient_vk: Vec<u8>) -> Self {
        Self {
            disposition: Disposition::Anoncrypt { recipient_vk },
            affirmed: ANONCRYPT_AFFIRMED,
            denied: ANONCRYPT_DENIED,
        }
    }

    pub fn authcrypted(sender_vk: Vec<u8>, recipient_vk: Vec<u8>) -> Self {
        Self {
            disposition: Disposition::Authcrypt {
                sender_vk,
                recipient_vk,
            },
            affirmed: AUTHCRYPT_AFFIRMED,
            denied: AUTHCRYPT_DENIED,
        }
    }

    pub fn disposition(&self) -> &Disposition {
        &self.disposition
    }

    pub fn affirmed(&self) -> ContextFlags {
        self.affirmed
    }

    pub fn denied(&self) -> ContextFlags {
        self.denied
    }

    /// Sender verification key; present only for authcrypted messages.
    pub fn sender_vk(&self) -> Option<&[u8]> {
        match &self.disposition {
            Disposition::Authcrypt { sender_vk, .. } => Some(sender_vk),
            _ => None,
        }
    }

    /// Recipient verification key the envelope was opened with; present
    /// for both encrypted dispositions.
    pub fn recipient_vk(&self) -> Option<&[u8]> {
        match &self.disposition {
            Disposition::Anoncrypt { recipient_vk }
            | Disposition::Authcrypt { recipient_vk, .. } => Some(recipient_vk),
            Disposition::Plaintext => None,
        }
    }

    pub fn is_authcrypted(&self) -> bool {
        matches!(self.disposition, Disposition::Authcrypt { .. })
    }

    pub fn is_anoncrypted(&self) -> bool {
        matches!(self.disposition, Disposition::Anoncrypt { .. })
    }

    pub fn is_plaintext(&self) -> bool {
        matches!(self.disposition, Disposition::Plaintext)
    }
}
