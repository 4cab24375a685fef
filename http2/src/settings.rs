//! Typed SETTINGS values (RFC 7540 Section 6.5), plus the two custom
//! parameters this transport negotiates: true-binary metadata and the
//! preferred receive crypto frame size.

use smallvec::SmallVec;

use crate::decode::FrameError;
use crate::frame::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE,
    MAX_WINDOW,
};

/// Setting identifiers, including the custom parameters (unknown ids are
/// carried through and ignored on application).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// Custom: binary metadata may be sent without base64 (0xfe03).
    AllowTrueBinaryMetadata,
    /// Custom: preferred frame size for encrypted receive paths (0xfe04).
    PreferredReceiveCryptoFrameSize,
    Unknown(u16),
}

impl SettingId {
    pub fn from_u16(id: u16) -> Self {
        match id {
            0x1 => SettingId::HeaderTableSize,
            0x2 => SettingId::EnablePush,
            0x3 => SettingId::MaxConcurrentStreams,
            0x4 => SettingId::InitialWindowSize,
            0x5 => SettingId::MaxFrameSize,
            0x6 => SettingId::MaxHeaderListSize,
            0xfe03 => SettingId::AllowTrueBinaryMetadata,
            0xfe04 => SettingId::PreferredReceiveCryptoFrameSize,
            other => SettingId::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            SettingId::HeaderTableSize => 0x1,
            SettingId::EnablePush => 0x2,
            SettingId::MaxConcurrentStreams => 0x3,
            SettingId::InitialWindowSize => 0x4,
            SettingId::MaxFrameSize => 0x5,
            SettingId::MaxHeaderListSize => 0x6,
            SettingId::AllowTrueBinaryMetadata => 0xfe03,
            SettingId::PreferredReceiveCryptoFrameSize => 0xfe04,
            SettingId::Unknown(id) => id,
        }
    }
}

/// One parameter in a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

/// One endpoint's full set of settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `u32::MAX` means unlimited (the parameter was never sent).
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub allow_true_binary_metadata: bool,
    /// 0 means the peer cannot adjust its sending frame size.
    pub preferred_receive_crypto_frame_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
            allow_true_binary_metadata: false,
            preferred_receive_crypto_frame_size: 0,
        }
    }
}

impl Settings {
    /// Apply one received parameter, validating its range.
    pub fn apply(&mut self, setting: Setting) -> Result<(), FrameError> {
        match setting.id {
            SettingId::HeaderTableSize => self.header_table_size = setting.value,
            SettingId::EnablePush => match setting.value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(invalid(setting)),
            },
            SettingId::MaxConcurrentStreams => self.max_concurrent_streams = setting.value,
            SettingId::InitialWindowSize => {
                if setting.value > MAX_WINDOW {
                    return Err(invalid(setting));
                }
                self.initial_window_size = setting.value;
            }
            SettingId::MaxFrameSize => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&setting.value) {
                    return Err(invalid(setting));
                }
                self.max_frame_size = setting.value;
            }
            SettingId::MaxHeaderListSize => self.max_header_list_size = setting.value,
            SettingId::AllowTrueBinaryMetadata => match setting.value {
                0 => self.allow_true_binary_metadata = false,
                1 => self.allow_true_binary_metadata = true,
                _ => return Err(invalid(setting)),
            },
            SettingId::PreferredReceiveCryptoFrameSize => {
                self.preferred_receive_crypto_frame_size = setting.value;
            }
            SettingId::Unknown(_) => {}
        }
        Ok(())
    }

    /// The parameters that differ from `acked`, in wire order. This is
    /// what a SETTINGS frame must carry to move the peer from `acked` to
    /// `self`.
    pub fn diff(&self, acked: &Settings) -> SmallVec<[Setting; 8]> {
        let mut out = SmallVec::new();
        let mut push = |id, value, changed: bool| {
            if changed {
                out.push(Setting { id, value });
            }
        };
        push(
            SettingId::HeaderTableSize,
            self.header_table_size,
            self.header_table_size != acked.header_table_size,
        );
        push(
            SettingId::EnablePush,
            self.enable_push as u32,
            self.enable_push != acked.enable_push,
        );
        push(
            SettingId::MaxConcurrentStreams,
            self.max_concurrent_streams,
            self.max_concurrent_streams != acked.max_concurrent_streams,
        );
        push(
            SettingId::InitialWindowSize,
            self.initial_window_size,
            self.initial_window_size != acked.initial_window_size,
        );
        push(
            SettingId::MaxFrameSize,
            self.max_frame_size,
            self.max_frame_size != acked.max_frame_size,
        );
        push(
            SettingId::MaxHeaderListSize,
            self.max_header_list_size,
            self.max_header_list_size != acked.max_header_list_size,
        );
        push(
            SettingId::AllowTrueBinaryMetadata,
            self.allow_true_binary_metadata as u32,
            self.allow_true_binary_metadata != acked.allow_true_binary_metadata,
        );
        push(
            SettingId::PreferredReceiveCryptoFrameSize,
            self.preferred_receive_crypto_frame_size,
            self.preferred_receive_crypto_frame_size != acked.preferred_receive_crypto_frame_size,
        );
        out
    }
}

fn invalid(setting: Setting) -> FrameError {
    FrameError::InvalidSetting {
        id: setting.id.as_u16(),
        value: setting.value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_id_roundtrip() {
        for id in [0x1u16, 0x2, 0x3, 0x4, 0x5, 0x6, 0xfe03, 0xfe04, 0x99] {
            assert_eq!(SettingId::from_u16(id).as_u16(), id);
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.initial_window_size, 65_535);
        assert_eq!(settings.max_frame_size, 16_384);
        assert_eq!(settings.max_concurrent_streams, u32::MAX);
        assert!(settings.enable_push);
        assert!(!settings.allow_true_binary_metadata);
    }

    #[test]
    fn test_apply_validates_enable_push() {
        let mut settings = Settings::default();
        assert!(
            settings
                .apply(Setting {
                    id: SettingId::EnablePush,
                    value: 2
                })
                .is_err()
        );
        settings
            .apply(Setting {
                id: SettingId::EnablePush,
                value: 0,
            })
            .unwrap();
        assert!(!settings.enable_push);
    }

    #[test]
    fn test_apply_validates_window_size() {
        let mut settings = Settings::default();
        assert!(
            settings
                .apply(Setting {
                    id: SettingId::InitialWindowSize,
                    value: 0x8000_0000
                })
                .is_err()
        );
    }

    #[test]
    fn test_apply_validates_max_frame_size() {
        let mut settings = Settings::default();
        assert!(
            settings
                .apply(Setting {
                    id: SettingId::MaxFrameSize,
                    value: 100
                })
                .is_err()
        );
        assert!(
            settings
                .apply(Setting {
                    id: SettingId::MaxFrameSize,
                    value: 1 << 24
                })
                .is_err()
        );
        settings
            .apply(Setting {
                id: SettingId::MaxFrameSize,
                value: 65_536,
            })
            .unwrap();
        assert_eq!(settings.max_frame_size, 65_536);
    }

    #[test]
    fn test_unknown_setting_ignored() {
        let mut settings = Settings::default();
        settings
            .apply(Setting {
                id: SettingId::Unknown(0x99),
                value: 7,
            })
            .unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_diff_empty_when_equal() {
        let settings = Settings::default();
        assert!(settings.diff(&settings).is_empty());
    }

    #[test]
    fn test_diff_lists_changes() {
        let acked = Settings::default();
        let mut local = acked;
        local.enable_push = false;
        local.initial_window_size = 1 << 20;
        local.allow_true_binary_metadata = true;

        let diff = local.diff(&acked);
        assert_eq!(diff.len(), 3);
        assert!(diff.contains(&Setting {
            id: SettingId::EnablePush,
            value: 0
        }));
        assert!(diff.contains(&Setting {
            id: SettingId::InitialWindowSize,
            value: 1 << 20
        }));
        assert!(diff.contains(&Setting {
            id: SettingId::AllowTrueBinaryMetadata,
            value: 1
        }));
    }

    #[test]
    fn test_diff_then_apply_converges() {
        let acked = Settings::default();
        let mut local = acked;
        local.max_concurrent_streams = 100;
        local.max_frame_size = 32_768;

        let mut replayed = acked;
        for setting in local.diff(&acked) {
            replayed.apply(setting).unwrap();
        }
        assert_eq!(replayed, local);
    }
}
