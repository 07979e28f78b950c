use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{MagmalinkError, MagmalinkResult};

/// One equalizer band. Fifteen bands (0-14) are available; gain ranges from
/// -0.25 (muted) to 1.0 (doubled).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Band {
    pub band: u8,
    pub gain: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f64,
    pub mono_level: f64,
    pub filter_band: f64,
    pub filter_width: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timescale {
    pub speed: f64,
    pub pitch: f64,
    pub rate: f64,
}

impl Default for Timescale {
    fn default() -> Self {
        Self { speed: 1.0, pitch: 1.0, rate: 1.0 }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Vibrato {
    pub frequency: f64,
    pub depth: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    pub sin_offset: f64,
    pub sin_scale: f64,
    pub cos_offset: f64,
    pub cos_scale: f64,
    pub tan_offset: f64,
    pub tan_scale: f64,
    pub offset: f64,
    pub scale: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Reverb {
    pub delays: Vec<f64>,
    pub gains: Vec<f64>,
}

/// Effect names tracked in the status map.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AvailableFilters {
    BassBoost,
    China,
    Chipmunk,
    Darthvader,
    Daycore,
    Demon,
    Distort,
    Doubletime,
    Earrape,
    EightD,
    Electronic,
    Karaoke,
    Nightcore,
    Party,
    Pop,
    Radio,
    Slowmo,
    Soft,
    TrebleBass,
    Tremolo,
    Tv,
    Vaporwave,
}

const ALL_FILTERS: [AvailableFilters; 22] = [
    AvailableFilters::BassBoost,
    AvailableFilters::China,
    AvailableFilters::Chipmunk,
    AvailableFilters::Darthvader,
    AvailableFilters::Daycore,
    AvailableFilters::Demon,
    AvailableFilters::Distort,
    AvailableFilters::Doubletime,
    AvailableFilters::Earrape,
    AvailableFilters::EightD,
    AvailableFilters::Electronic,
    AvailableFilters::Karaoke,
    AvailableFilters::Nightcore,
    AvailableFilters::Party,
    AvailableFilters::Pop,
    AvailableFilters::Radio,
    AvailableFilters::Slowmo,
    AvailableFilters::Soft,
    AvailableFilters::TrebleBass,
    AvailableFilters::Tremolo,
    AvailableFilters::Tv,
    AvailableFilters::Vaporwave,
];

/// Composable audio-effect state for one player. Blocks are optional; the
/// node receives exactly the non-null subset.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    pub equalizer: Option<Vec<Band>>,
    pub karaoke: Option<Karaoke>,
    pub timescale: Option<Timescale>,
    pub vibrato: Option<Vibrato>,
    pub rotation: Option<Rotation>,
    pub distortion: Option<Distortion>,
    pub reverb: Option<Reverb>,
    pub volume: Option<f64>,
    filters_status: HashMap<AvailableFilters, bool>,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            equalizer: None,
            karaoke: None,
            timescale: None,
            vibrato: None,
            rotation: None,
            distortion: None,
            reverb: None,
            volume: None,
            filters_status: ALL_FILTERS.iter().map(|f| (*f, false)).collect(),
        }
    }
}

impl Filters {
    pub fn enabled(&self, filter: AvailableFilters) -> bool {
        self.filters_status.get(&filter).copied().unwrap_or(false)
    }

    pub fn status(&self) -> &HashMap<AvailableFilters, bool> {
        &self.filters_status
    }

    fn set_status(&mut self, filter: AvailableFilters, enabled: bool) {
        self.filters_status.insert(filter, enabled);
    }

    /// Wire payload for `updatePlayer`: only the non-null blocks.
    pub fn payload(&self) -> Value {
        let mut map = serde_json::Map::new();

        if let Some(equalizer) = &self.equalizer {
            map.insert("equalizer".into(), serde_json::to_value(equalizer).unwrap_or(Value::Null));
        }
        if let Some(karaoke) = &self.karaoke {
            map.insert("karaoke".into(), serde_json::to_value(karaoke).unwrap_or(Value::Null));
        }
        if let Some(timescale) = &self.timescale {
            map.insert("timescale".into(), serde_json::to_value(timescale).unwrap_or(Value::Null));
        }
        if let Some(vibrato) = &self.vibrato {
            map.insert("vibrato".into(), serde_json::to_value(vibrato).unwrap_or(Value::Null));
        }
        if let Some(rotation) = &self.rotation {
            map.insert("rotation".into(), serde_json::to_value(rotation).unwrap_or(Value::Null));
        }
        if let Some(distortion) = &self.distortion {
            map.insert("distortion".into(), serde_json::to_value(distortion).unwrap_or(Value::Null));
        }
        if let Some(reverb) = &self.reverb {
            map.insert("reverb".into(), serde_json::to_value(reverb).unwrap_or(Value::Null));
        }
        if let Some(volume) = self.volume {
            map.insert("volume".into(), Value::from(volume));
        }

        Value::Object(map)
    }

    /// Resets every block and flag. The caller pushes the cleared payload.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Boosts the low bands. `level` ranges from -3 (cut) to 3 (heavy
    /// boost); 0 removes the effect.
    pub fn bass_boost(&mut self, level: i8) -> MagmalinkResult<()> {
        if !(-3..=3).contains(&level) {
            return Err(MagmalinkError::InvalidConfig("bassBoost level must be within -3..=3"));
        }

        if level == 0 {
            self.equalizer = None;
            self.set_status(AvailableFilters::BassBoost, false);
            return Ok(());
        }

        let gain = f64::from(level) * 0.0625;
        self.equalizer = Some(
            (0u8..15)
                .map(|band| Band {
                    band,
                    gain: match band {
                        0..=1 => gain * 2.0,
                        2..=3 => gain * 1.5,
                        4..=5 => gain,
                        _ => 0.0,
                    },
                })
                .collect(),
        );
        self.set_status(AvailableFilters::BassBoost, true);
        Ok(())
    }

    pub fn nightcore(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 1.1, pitch: 1.125, rate: 1.05 });
        self.set_status(AvailableFilters::Nightcore, enabled);
    }

    pub fn daycore(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 0.85, pitch: 0.85, rate: 0.9 });
        self.set_status(AvailableFilters::Daycore, enabled);
    }

    pub fn slowmo(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 0.7, pitch: 1.0, rate: 0.8 });
        self.set_status(AvailableFilters::Slowmo, enabled);
    }

    pub fn vaporwave(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 0.8, pitch: 0.5, rate: 1.0 });
        self.set_status(AvailableFilters::Vaporwave, enabled);
    }

    pub fn doubletime(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 1.165, pitch: 1.0, rate: 1.0 });
        self.set_status(AvailableFilters::Doubletime, enabled);
    }

    pub fn chipmunk(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 1.05, pitch: 1.35, rate: 1.25 });
        self.set_status(AvailableFilters::Chipmunk, enabled);
    }

    pub fn china(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 0.75, pitch: 1.25, rate: 1.25 });
        self.set_status(AvailableFilters::China, enabled);
    }

    pub fn darthvader(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 0.975, pitch: 0.5, rate: 0.8 });
        self.set_status(AvailableFilters::Darthvader, enabled);
    }

    pub fn demon(&mut self, enabled: bool) {
        self.timescale = enabled.then(|| Timescale { speed: 0.8, pitch: 0.65, rate: 0.8 });
        self.equalizer = enabled.then(|| {
            (0u8..15)
                .map(|band| Band { band, gain: if band < 4 { 0.25 } else { 0.0 } })
                .collect()
        });
        self.set_status(AvailableFilters::Demon, enabled);
    }

    pub fn eight_d(&mut self, enabled: bool) {
        self.rotation = enabled.then(|| Rotation { rotation_hz: 0.2 });
        self.set_status(AvailableFilters::EightD, enabled);
    }

    pub fn tremolo(&mut self, enabled: bool) {
        self.vibrato = enabled.then(|| Vibrato { frequency: 4.0, depth: 0.75 });
        self.set_status(AvailableFilters::Tremolo, enabled);
    }

    pub fn karaoke(&mut self, enabled: bool) {
        self.karaoke = enabled.then(|| Karaoke {
            level: 1.0,
            mono_level: 1.0,
            filter_band: 220.0,
            filter_width: 100.0,
        });
        self.set_status(AvailableFilters::Karaoke, enabled);
    }

    pub fn distort(&mut self, enabled: bool) {
        self.distortion = enabled.then(|| Distortion {
            sin_offset: 0.0,
            sin_scale: 0.2,
            cos_offset: 0.0,
            cos_scale: 0.2,
            tan_offset: 0.0,
            tan_scale: 0.2,
            offset: 0.0,
            scale: 1.2,
        });
        self.set_status(AvailableFilters::Distort, enabled);
    }

    pub fn earrape(&mut self, enabled: bool) {
        self.volume = enabled.then_some(5.0);
        self.distortion = enabled.then(|| Distortion {
            sin_offset: 0.0,
            sin_scale: 0.5,
            cos_offset: 0.0,
            cos_scale: 0.5,
            tan_offset: 0.0,
            tan_scale: 0.5,
            offset: 0.0,
            scale: 2.0,
        });
        self.set_status(AvailableFilters::Earrape, enabled);
    }

    pub fn soft(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            (0u8..15)
                .map(|band| Band { band, gain: if band > 9 { -0.25 } else { 0.0 } })
                .collect()
        });
        self.set_status(AvailableFilters::Soft, enabled);
    }

    pub fn tv(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            (0u8..15)
                .map(|band| Band { band, gain: if (7..=13).contains(&band) { 0.65 } else { 0.0 } })
                .collect()
        });
        self.set_status(AvailableFilters::Tv, enabled);
    }

    pub fn party(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            (0u8..15)
                .map(|band| Band { band, gain: if band < 2 { 0.25 } else { 0.0 } })
                .collect()
        });
        self.set_status(AvailableFilters::Party, enabled);
    }

    pub fn electronic(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            let gains = [0.375, 0.35, 0.125, 0.0, 0.0, -0.125, -0.125, 0.0, 0.25, 0.125, 0.15, 0.2, 0.25, 0.35, 0.4];
            gains
                .iter()
                .enumerate()
                .map(|(band, gain)| Band { band: band as u8, gain: *gain })
                .collect()
        });
        self.set_status(AvailableFilters::Electronic, enabled);
    }

    pub fn radio(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            (0u8..15)
                .map(|band| Band { band, gain: if (4..=9).contains(&band) { 0.65 } else { -0.25 } })
                .collect()
        });
        self.set_status(AvailableFilters::Radio, enabled);
    }

    pub fn treble_bass(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            let gains = [0.6, 0.67, 0.67, 0.0, -0.5, 0.15, -0.45, 0.23, 0.35, 0.45, 0.55, 0.6, 0.55, 0.0, 0.0];
            gains
                .iter()
                .enumerate()
                .map(|(band, gain)| Band { band: band as u8, gain: *gain })
                .collect()
        });
        self.set_status(AvailableFilters::TrebleBass, enabled);
    }

    pub fn pop(&mut self, enabled: bool) {
        self.equalizer = enabled.then(|| {
            let gains = [-0.25, 0.48, 0.59, 0.72, 0.56, 0.15, -0.24, -0.24, -0.16, -0.16, 0.0, 0.0, 0.0, 0.0, 0.0];
            gains
                .iter()
                .enumerate()
                .map(|(band, gain)| Band { band: band as u8, gain: *gain })
                .collect()
        });
        self.set_status(AvailableFilters::Pop, enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_set_blocks_and_flags() {
        let mut filters = Filters::default();
        assert!(!filters.enabled(AvailableFilters::Nightcore));

        filters.nightcore(true);
        assert!(filters.enabled(AvailableFilters::Nightcore));
        assert_eq!(filters.timescale.as_ref().unwrap().pitch, 1.125);

        filters.nightcore(false);
        assert!(!filters.enabled(AvailableFilters::Nightcore));
        assert!(filters.timescale.is_none());
    }

    #[test]
    fn bass_boost_rejects_out_of_range_levels() {
        let mut filters = Filters::default();
        assert!(filters.bass_boost(4).is_err());
        assert!(filters.bass_boost(-4).is_err());

        filters.bass_boost(2).unwrap();
        assert!(filters.enabled(AvailableFilters::BassBoost));
        assert_eq!(filters.equalizer.as_ref().unwrap().len(), 15);

        filters.bass_boost(0).unwrap();
        assert!(!filters.enabled(AvailableFilters::BassBoost));
        assert!(filters.equalizer.is_none());
    }

    #[test]
    fn payload_contains_only_non_null_blocks() {
        let mut filters = Filters::default();
        filters.eight_d(true);

        let payload = filters.payload();
        let object = payload.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["rotation"]["rotationHz"], 0.2);
    }

    #[test]
    fn clear_resets_blocks_and_flags() {
        let mut filters = Filters::default();
        filters.karaoke(true);
        filters.earrape(true);

        filters.clear();

        assert_eq!(filters, Filters::default());
        assert_eq!(filters.payload(), serde_json::json!({}));
    }
}
