//! Channel-window selections for each uGMRT correlator configuration.
//!
//! Band edges roll off and the outermost channels are unusable, so every
//! stage works on an inner window whose extent depends on the channel
//! count. The ladder covers the standard GMRT wideband modes.

/// Channel windows keyed by correlator channel count.
///
/// Selectors use the `spw:start~stop` form. The self-calibration window is
/// empty: split files carry only good channels, so self-calibration uses
/// the whole band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelWindows {
    /// Narrow clean window used for amplitude statistics
    pub probe: String,
    /// Wide window used for flagging and the initial calibration solves
    pub flag: String,
    /// Inner window used for per-calibrator gains and target splits
    pub gain: String,
}

/// probe, flag, gain per channel count.
const LADDER: [(usize, &str, &str, &str); 6] = [
    (128, "0:50~70", "0:5~115", "0:11~115"),
    (256, "0:100~120", "0:11~240", "0:21~230"),
    (2048, "0:500~600", "0:101~1900", "0:201~1800"),
    (4096, "0:1000~1200", "0:41~4050", "0:201~3600"),
    (8192, "0:2000~3000", "0:500~7800", "0:1000~7000"),
    (16384, "0:4000~6000", "0:1000~14500", "0:2000~13500"),
];

impl ChannelWindows {
    /// Look up the windows for a correlator channel count, or `None` when
    /// the count is not a standard GMRT mode.
    pub fn for_channel_count(nchan: usize) -> Option<ChannelWindows> {
        LADDER
            .iter()
            .find(|(count, _, _, _)| *count == nchan)
            .map(|(_, probe, flag, gain)| ChannelWindows {
                probe: (*probe).to_string(),
                flag: (*flag).to_string(),
                gain: (*gain).to_string(),
            })
    }

    /// The channel counts the ladder covers, ascending.
    pub fn supported_counts() -> Vec<usize> {
        LADDER.iter().map(|(count, _, _, _)| *count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_wideband_mode() {
        let windows = ChannelWindows::for_channel_count(2048).unwrap();
        assert_eq!(windows.probe, "0:500~600");
        assert_eq!(windows.flag, "0:101~1900");
        assert_eq!(windows.gain, "0:201~1800");
    }

    #[test]
    fn legacy_narrowband_mode() {
        let windows = ChannelWindows::for_channel_count(128).unwrap();
        assert_eq!(windows.gain, "0:11~115");
    }

    #[test]
    fn unknown_count_is_refused() {
        assert!(ChannelWindows::for_channel_count(1024).is_none());
        assert_eq!(
            ChannelWindows::supported_counts(),
            vec![128, 256, 2048, 4096, 8192, 16384]
        );
    }
}
