//! The closed set of rate limiter descriptors.
//!
//! Each descriptor names one rate-limited operation. Its id is embedded in
//! every bucket key written to the store, so renaming an id orphans the
//! existing buckets for that descriptor.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use super::config::RateLimiterConfig;

/// Static metadata for a named rate limiter slot.
pub trait RateLimiterDescriptor: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Stable id, unique across the registry.
    fn id(&self) -> &'static str;

    /// Whether live configuration may replace the config of this descriptor.
    fn is_dynamic(&self) -> bool;

    /// Config enforced when nothing overrides it.
    fn default_config(&self) -> RateLimiterConfig;
}

/// Production rate limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum For {
    BackupAuthCheck,
    SmsDestination,
    VoiceDestination,
    VoiceDestinationDaily,
    SmsVoiceIp,
    SmsVoicePrefix,
    Verify,
    Pin,
    Attachment,
    PreKeys,
    Messages,
    AllocateDevice,
    VerifyDevice,
    Turn,
    Profile,
    StickerPack,
    ArtPack,
    UsernameLookup,
    UsernameSet,
    UsernameReserve,
    UsernameLinkOperation,
    UsernameLinkLookupPerIp,
    CheckAccountExistence,
    Registration,
    VerificationPushChallenge,
    VerificationCaptcha,
    RateLimitReset,
    RecaptchaChallengeAttempt,
    RecaptchaChallengeSuccess,
    PushChallengeAttempt,
    PushChallengeSuccess,
    CreateCallLink,
    /// Weighted by payload size: one permit per inbound byte.
    InboundMessageBytes,
}

const fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

const fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

const fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

struct Entry {
    id: &'static str,
    dynamic: bool,
    config: RateLimiterConfig,
}

const fn entry(id: &'static str, dynamic: bool, bucket_size: u64, interval: Duration) -> Entry {
    Entry {
        id,
        dynamic,
        config: RateLimiterConfig::new(bucket_size, interval),
    }
}

impl For {
    /// Every production descriptor.
    pub const ALL: [For; 33] = [
        For::BackupAuthCheck,
        For::SmsDestination,
        For::VoiceDestination,
        For::VoiceDestinationDaily,
        For::SmsVoiceIp,
        For::SmsVoicePrefix,
        For::Verify,
        For::Pin,
        For::Attachment,
        For::PreKeys,
        For::Messages,
        For::AllocateDevice,
        For::VerifyDevice,
        For::Turn,
        For::Profile,
        For::StickerPack,
        For::ArtPack,
        For::UsernameLookup,
        For::UsernameSet,
        For::UsernameReserve,
        For::UsernameLinkOperation,
        For::UsernameLinkLookupPerIp,
        For::CheckAccountExistence,
        For::Registration,
        For::VerificationPushChallenge,
        For::VerificationCaptcha,
        For::RateLimitReset,
        For::RecaptchaChallengeAttempt,
        For::RecaptchaChallengeSuccess,
        For::PushChallengeAttempt,
        For::PushChallengeSuccess,
        For::CreateCallLink,
        For::InboundMessageBytes,
    ];

    /// Look up a descriptor by its id.
    pub fn from_id(id: &str) -> Option<For> {
        For::ALL.into_iter().find(|d| d.id() == id)
    }

    fn entry(&self) -> Entry {
        match self {
            For::BackupAuthCheck => entry("backupAuthCheck", false, 100, secs(15)),
            For::SmsDestination => entry("smsDestination", false, 2, millis(500)),
            For::VoiceDestination => entry("voxDestination", false, 2, secs(2)),
            For::VoiceDestinationDaily => entry("voxDestinationDaily", false, 10, secs(144)),
            For::SmsVoiceIp => entry("smsVoiceIp", false, 1000, millis(1)),
            For::SmsVoicePrefix => entry("smsVoicePrefix", false, 1000, millis(1)),
            For::Verify => entry("verify", false, 6, millis(500)),
            For::Pin => entry("pin", false, 10, minutes(24)),
            For::Attachment => entry("attachmentCreate", false, 50, millis(20)),
            For::PreKeys => entry("prekeys", false, 6, secs(10)),
            For::Messages => entry("messages", false, 60, millis(17)),
            For::AllocateDevice => entry("allocateDevice", false, 2, secs(2)),
            For::VerifyDevice => entry("verifyDevice", false, 6, secs(10)),
            For::Turn => entry("turnAllocate", false, 60, millis(17)),
            For::Profile => entry("profile", false, 4320, millis(333)),
            For::StickerPack => entry("stickerPack", false, 50, secs(72)),
            For::ArtPack => entry("artPack", false, 50, secs(72)),
            For::UsernameLookup => entry("usernameLookup", false, 100, secs(15)),
            For::UsernameSet => entry("usernameSet", false, 100, secs(15)),
            For::UsernameReserve => entry("usernameReserve", false, 100, secs(15)),
            For::UsernameLinkOperation => entry("usernameLinkOperation", false, 10, minutes(1)),
            For::UsernameLinkLookupPerIp => {
                entry("usernameLinkLookupPerIp", false, 100, secs(15))
            }
            For::CheckAccountExistence => entry("checkAccountExistence", false, 1000, millis(60)),
            For::Registration => entry("registration", false, 6, millis(500)),
            For::VerificationPushChallenge => {
                entry("verificationPushChallenge", false, 5, millis(500))
            }
            For::VerificationCaptcha => entry("verificationCaptcha", false, 10, millis(500)),
            For::RateLimitReset => entry("rateLimitReset", true, 2, minutes(12)),
            For::RecaptchaChallengeAttempt => {
                entry("recaptchaChallengeAttempt", true, 10, secs(144))
            }
            For::RecaptchaChallengeSuccess => {
                entry("recaptchaChallengeSuccess", true, 2, minutes(12))
            }
            For::PushChallengeAttempt => entry("pushChallengeAttempt", true, 10, secs(144)),
            For::PushChallengeSuccess => entry("pushChallengeSuccess", true, 2, minutes(12)),
            For::CreateCallLink => entry("createCallLink", false, 100, secs(15)),
            For::InboundMessageBytes => entry(
                "inboundMessageBytes",
                true,
                128 * 1024 * 1024,
                Duration::from_micros(500),
            ),
        }
    }
}

impl RateLimiterDescriptor for For {
    fn id(&self) -> &'static str {
        self.entry().id
    }

    fn is_dynamic(&self) -> bool {
        self.entry().dynamic
    }

    fn default_config(&self) -> RateLimiterConfig {
        self.entry().config
    }
}

impl std::fmt::Display for For {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}
