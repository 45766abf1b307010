// crates/aircast-media/src/settings.rs
//
// Codec settings tables. The pipeline treats them as opaque keyed mappings:
// the encoder materializes `for_each` into the codec's open-time dictionary
// and never interprets the keys. Tables that can retarget their bitrate
// expose that through `bitrate_control`; the table, not the codec context,
// is the source of truth for the current target.
//
// x264 rate figures are kilobits inside the tables (x264's own unit); the
// public API always speaks bits per second.

use crate::error::Result;

pub trait CodecSettings: Send {
    /// Visit every key/value pair destined for the open-time dictionary.
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> Result<()>) -> Result<()>;

    /// Current bitrate target in bits per second, when the table tracks one.
    fn target_bitrate(&self) -> Option<i64> {
        None
    }

    /// Mutable bitrate capability; `None` means this table cannot retarget.
    fn bitrate_control(&mut self) -> Option<&mut dyn BitrateControl> {
        None
    }
}

pub trait BitrateControl {
    fn set_target_bitrate(&mut self, bps: i64);
}

/// Single-instant VBV buffer for low latency, floored at 100 kb.
fn vbv_buffer_kb(kbps: i64) -> i64 {
    (kbps / 2).max(100)
}

// ── x264, one dictionary entry per option ────────────────────────────────

/// Flat x264 table: every option is its own dictionary entry.
#[derive(Clone, Debug)]
pub struct X264Settings {
    pub preset: String,
    pub tune: String,
    pub refs: String,
    pub profile: String,
    pub level: String,
    pub qmin: String,
    pub qmax: String,
    pub bframes: String,
    pub b_adapt: String,
    pub keyint: String,
    pub min_keyint: String,
    pub scenecut: String,
    pub intra_refresh: String,
    pub rc_lookahead: String,
    pub sliced_threads: String,
    pub sync_lookahead: String,
    pub force_idr: String,
    pub aq_mode: String,
    pub aq_strength: String,
    pub mbtree: String,
    /// kbps
    pub bitrate: String,
    /// kbps
    pub vbv_maxrate: String,
    /// kb
    pub vbv_bufsize: String,
    pub ratetol: String,
    pub threads: String,
    pub annexb: String,
    pub aud: String,
}

macro_rules! x264_settings {
    ($($field:ident : $value:expr),* $(,)?) => {
        X264Settings { $($field: $value.into()),* }
    };
}

impl X264Settings {
    pub fn standard() -> Self {
        x264_settings! {
            preset: "medium", tune: "film", refs: "6", profile: "high",
            level: "auto", qmin: "18", qmax: "28", bframes: "3", b_adapt: "1",
            keyint: "250", min_keyint: "25", scenecut: "40", intra_refresh: "0",
            rc_lookahead: "40", sliced_threads: "0", sync_lookahead: "1",
            force_idr: "0", aq_mode: "1", aq_strength: "1.0", mbtree: "1",
            bitrate: "4000", vbv_maxrate: "5000", vbv_bufsize: "8000",
            ratetol: "1", threads: "0", annexb: "1", aud: "0",
        }
    }

    pub fn low_bandwidth() -> Self {
        x264_settings! {
            preset: "veryfast", tune: "fastdecode", refs: "2", profile: "baseline",
            level: "4.1", qmin: "23", qmax: "35", bframes: "0", b_adapt: "0",
            keyint: "60", min_keyint: "30", scenecut: "30", intra_refresh: "0",
            rc_lookahead: "20", sliced_threads: "1", sync_lookahead: "0",
            force_idr: "0", aq_mode: "0", aq_strength: "1.2", mbtree: "0",
            bitrate: "1500", vbv_maxrate: "1800", vbv_bufsize: "3000",
            ratetol: "0.25", threads: "0", annexb: "1", aud: "0",
        }
    }

    pub fn low_latency() -> Self {
        x264_settings! {
            preset: "ultrafast", tune: "zerolatency", refs: "1", profile: "baseline",
            level: "4.1", qmin: "20", qmax: "32", bframes: "0", b_adapt: "0",
            keyint: "30", min_keyint: "15", scenecut: "0", intra_refresh: "1",
            rc_lookahead: "10", sliced_threads: "1", sync_lookahead: "0",
            force_idr: "1", aq_mode: "0", aq_strength: "0", mbtree: "0",
            bitrate: "2500", vbv_maxrate: "3000", vbv_bufsize: "5000",
            ratetol: "0.5", threads: "0", annexb: "1", aud: "1",
        }
    }

    pub fn high_quality() -> Self {
        x264_settings! {
            preset: "slow", tune: "film", refs: "8", profile: "high",
            level: "5.1", qmin: "15", qmax: "24", bframes: "5", b_adapt: "2",
            keyint: "250", min_keyint: "30", scenecut: "80", intra_refresh: "0",
            rc_lookahead: "60", sliced_threads: "0", sync_lookahead: "1",
            force_idr: "0", aq_mode: "0", aq_strength: "1.3", mbtree: "1",
            bitrate: "15000", vbv_maxrate: "20000", vbv_bufsize: "30000",
            ratetol: "2.0", threads: "0", annexb: "1", aud: "0",
        }
    }

    fn entries(&self) -> [(&'static str, &str); 27] {
        [
            ("preset", &self.preset),
            ("tune", &self.tune),
            ("refs", &self.refs),
            ("profile", &self.profile),
            ("level", &self.level),
            ("qmin", &self.qmin),
            ("qmax", &self.qmax),
            ("bframes", &self.bframes),
            ("b-adapt", &self.b_adapt),
            ("keyint", &self.keyint),
            ("min-keyint", &self.min_keyint),
            ("scenecut", &self.scenecut),
            ("intra-refresh", &self.intra_refresh),
            ("rc-lookahead", &self.rc_lookahead),
            ("sliced-threads", &self.sliced_threads),
            ("sync-lookahead", &self.sync_lookahead),
            ("force-idr", &self.force_idr),
            ("aq-mode", &self.aq_mode),
            ("aq-strength", &self.aq_strength),
            ("mbtree", &self.mbtree),
            ("bitrate", &self.bitrate),
            ("vbv-maxrate", &self.vbv_maxrate),
            ("vbv-bufsize", &self.vbv_bufsize),
            ("ratetol", &self.ratetol),
            ("threads", &self.threads),
            ("annexb", &self.annexb),
            ("aud", &self.aud),
        ]
    }
}

impl Default for X264Settings {
    fn default() -> Self {
        Self::standard()
    }
}

impl CodecSettings for X264Settings {
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> Result<()>) -> Result<()> {
        for (key, value) in self.entries() {
            if !value.is_empty() {
                visit(key, value)?;
            }
        }
        Ok(())
    }

    fn target_bitrate(&self) -> Option<i64> {
        self.bitrate.parse::<i64>().ok().map(|kbps| kbps * 1000)
    }

    fn bitrate_control(&mut self) -> Option<&mut dyn BitrateControl> {
        Some(self)
    }
}

impl BitrateControl for X264Settings {
    fn set_target_bitrate(&mut self, bps: i64) {
        let kbps = bps / 1000;
        self.bitrate = kbps.to_string();
        // CBR: cap equals target.
        self.vbv_maxrate = kbps.to_string();
        self.vbv_bufsize = vbv_buffer_kb(kbps).to_string();
    }
}

// ── x264, packed `x264opts` form ─────────────────────────────────────────

/// x264 table that packs the primary options into a single `x264opts`
/// `k=v:k=v` entry, keeping only preset/profile/level/tune precompiled.
#[derive(Clone, Debug, Default)]
pub struct X264Opts {
    pub profile: String,
    pub level: String,
    pub preset: String,
    pub tune: String,

    /// kbps
    pub bitrate: String,
    /// kbps
    pub vbv_maxrate: String,
    /// kb
    pub vbv_bufsize: String,
    pub ratetol: String,
    pub keyint: String,
    pub min_keyint: String,
    pub qpmax: String,
    pub qpmin: String,
    pub qpstep: String,
    pub intra_refresh: String,
    pub constrained_intra: String,
    pub scenecut: String,
    pub bframes: String,
    pub b_adapt: String,
    pub refs: String,
    pub rc_lookahead: String,
    pub aq_mode: String,
    pub nal_hrd: String,
}

impl X264Opts {
    /// Strict CBR at 500 kbps with a zero-lookahead chain, the profile used
    /// for bandwidth-estimated WebRTC video.
    pub fn low_latency_cbr() -> Self {
        Self {
            profile: "baseline".into(),
            level: "3.1".into(),
            preset: "ultrafast".into(),
            tune: "zerolatency".into(),
            bitrate: "500".into(),
            vbv_maxrate: "500".into(),
            vbv_bufsize: "250".into(),
            ratetol: "1".into(),
            keyint: "25".into(),
            min_keyint: "13".into(),
            intra_refresh: "0".into(),
            constrained_intra: "0".into(),
            scenecut: "0".into(),
            bframes: "0".into(),
            b_adapt: "0".into(),
            refs: "1".into(),
            rc_lookahead: "0".into(),
            aq_mode: "1".into(),
            nal_hrd: "cbr".into(),
            ..Self::default()
        }
    }

    fn packed(&self) -> String {
        let entries: [(&str, &str); 18] = [
            ("bitrate", &self.bitrate),
            ("vbv-maxrate", &self.vbv_maxrate),
            ("vbv-bufsize", &self.vbv_bufsize),
            ("ratetol", &self.ratetol),
            ("keyint", &self.keyint),
            ("min-keyint", &self.min_keyint),
            ("qpmax", &self.qpmax),
            ("qpmin", &self.qpmin),
            ("qpstep", &self.qpstep),
            ("intra-refresh", &self.intra_refresh),
            ("constrained-intra", &self.constrained_intra),
            ("scenecut", &self.scenecut),
            ("bframes", &self.bframes),
            ("b-adapt", &self.b_adapt),
            ("ref", &self.refs),
            ("rc-lookahead", &self.rc_lookahead),
            ("aq-mode", &self.aq_mode),
            ("nal-hrd", &self.nal_hrd),
        ];
        entries
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl CodecSettings for X264Opts {
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> Result<()>) -> Result<()> {
        let precompiled: [(&str, &str); 4] = [
            ("profile", &self.profile),
            ("level", &self.level),
            ("preset", &self.preset),
            ("tune", &self.tune),
        ];
        for (key, value) in precompiled {
            if !value.is_empty() {
                visit(key, value)?;
            }
        }
        let packed = self.packed();
        if !packed.is_empty() {
            visit("x264opts", &packed)?;
        }
        Ok(())
    }

    fn target_bitrate(&self) -> Option<i64> {
        self.bitrate.parse::<i64>().ok().map(|kbps| kbps * 1000)
    }

    fn bitrate_control(&mut self) -> Option<&mut dyn BitrateControl> {
        Some(self)
    }
}

impl BitrateControl for X264Opts {
    fn set_target_bitrate(&mut self, bps: i64) {
        let kbps = bps / 1000;
        self.bitrate = kbps.to_string();
        self.vbv_maxrate = kbps.to_string();
        self.vbv_bufsize = vbv_buffer_kb(kbps).to_string();
    }
}

// ── VP8 ──────────────────────────────────────────────────────────────────

/// libvpx VP8 table. Rate options are bits per second, libvpx's own unit.
#[derive(Clone, Debug)]
pub struct Vp8Settings {
    pub deadline: String,
    /// bps
    pub bitrate: String,
    /// bps
    pub minrate: String,
    /// bps
    pub maxrate: String,
    pub bufsize: String,
    pub crf: String,
    pub cpu_used: String,
}

impl Vp8Settings {
    pub fn realtime() -> Self {
        Self {
            deadline: "realtime".into(),
            bitrate: "1000000".into(),
            minrate: "1000000".into(),
            maxrate: "1000000".into(),
            bufsize: "500000".into(),
            crf: "10".into(),
            cpu_used: "5".into(),
        }
    }
}

impl Default for Vp8Settings {
    fn default() -> Self {
        Self::realtime()
    }
}

impl CodecSettings for Vp8Settings {
    fn for_each(&self, visit: &mut dyn FnMut(&str, &str) -> Result<()>) -> Result<()> {
        let entries: [(&str, &str); 7] = [
            ("deadline", &self.deadline),
            ("b", &self.bitrate),
            ("minrate", &self.minrate),
            ("maxrate", &self.maxrate),
            ("bufsize", &self.bufsize),
            ("crf", &self.crf),
            ("cpu-used", &self.cpu_used),
        ];
        for (key, value) in entries {
            if !value.is_empty() {
                visit(key, value)?;
            }
        }
        Ok(())
    }

    fn target_bitrate(&self) -> Option<i64> {
        self.bitrate.parse::<i64>().ok()
    }

    fn bitrate_control(&mut self) -> Option<&mut dyn BitrateControl> {
        Some(self)
    }
}

impl BitrateControl for Vp8Settings {
    fn set_target_bitrate(&mut self, bps: i64) {
        self.bitrate = bps.to_string();
        self.minrate = bps.to_string();
        self.maxrate = bps.to_string();
        self.bufsize = (bps / 2).to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn collect(settings: &dyn CodecSettings) -> HashMap<String, String> {
        let mut seen = HashMap::new();
        settings
            .for_each(&mut |key, value| {
                seen.insert(key.to_owned(), value.to_owned());
                Ok(())
            })
            .unwrap();
        seen
    }

    #[test]
    fn flat_table_materializes_every_option() {
        let seen = collect(&X264Settings::low_latency());
        assert_eq!(seen.len(), 27);
        assert_eq!(seen["tune"], "zerolatency");
        assert_eq!(seen["bitrate"], "2500");
        assert_eq!(seen["min-keyint"], "15");
        assert_eq!(seen["aud"], "1");
    }

    #[test]
    fn packed_table_joins_primary_options_into_x264opts() {
        let seen = collect(&X264Opts::low_latency_cbr());
        assert_eq!(seen["preset"], "ultrafast");
        assert_eq!(seen["profile"], "baseline");
        let packed = &seen["x264opts"];
        assert!(packed.starts_with("bitrate=500:vbv-maxrate=500:vbv-bufsize=250"));
        assert!(packed.contains("ref=1"));
        assert!(packed.contains("nal-hrd=cbr"));
        // Unset fields never appear.
        assert!(!packed.contains("qpmax"));
    }

    #[test]
    fn bitrate_update_rewrites_rate_and_vbv_keys() {
        let mut opts = X264Opts::low_latency_cbr();
        opts.bitrate_control().unwrap().set_target_bitrate(2_000_000);
        assert_eq!(opts.bitrate, "2000");
        assert_eq!(opts.vbv_maxrate, "2000");
        assert_eq!(opts.vbv_bufsize, "1000");
        assert_eq!(opts.target_bitrate(), Some(2_000_000));
    }

    #[test]
    fn vbv_buffer_is_floored() {
        let mut opts = X264Opts::low_latency_cbr();
        opts.bitrate_control().unwrap().set_target_bitrate(150_000);
        assert_eq!(opts.vbv_bufsize, "100");
    }

    #[test]
    fn table_is_the_bitrate_source_of_truth() {
        let mut table = X264Settings::standard();
        assert_eq!(table.target_bitrate(), Some(4_000_000));
        table.bitrate_control().unwrap().set_target_bitrate(900_000);
        assert_eq!(table.target_bitrate(), Some(900_000));
        assert_eq!(table.vbv_maxrate, "900");
    }

    #[test]
    fn vp8_table_speaks_bits_per_second() {
        let mut vp8 = Vp8Settings::realtime();
        vp8.bitrate_control().unwrap().set_target_bitrate(750_000);
        let seen = collect(&vp8);
        assert_eq!(seen["b"], "750000");
        assert_eq!(seen["minrate"], "750000");
        assert_eq!(seen["maxrate"], "750000");
        assert_eq!(vp8.target_bitrate(), Some(750_000));
    }
}
