//! Built-in one-bar beats.

use drumseq_transport::{Grid, Instrument, Lane, STARTER_BAR_STEPS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HatFeel {
    Straight,
    Eighths,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    hats: HatFeel,
}

pub const PRESETS: [Preset; 5] = [
    Preset {
        id: "basic_rock",
        name: "Basic Rock",
        description: "Four on the floor with straight sixteenth hats",
        hats: HatFeel::Straight,
    },
    Preset {
        id: "funk",
        name: "Funk",
        description: "Offbeat snare over eighth-note hats",
        hats: HatFeel::Eighths,
    },
    Preset {
        id: "jazz",
        name: "Jazz",
        description: "Light eighth-note hats",
        hats: HatFeel::Eighths,
    },
    Preset {
        id: "latin",
        name: "Latin",
        description: "Driving sixteenth hats",
        hats: HatFeel::Straight,
    },
    Preset {
        id: "electronic",
        name: "Electronic",
        description: "Four on the floor for dance tracks",
        hats: HatFeel::Straight,
    },
];

pub fn preset(id: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|preset| preset.id == id)
}

pub fn preset_ids() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|preset| preset.id)
}

impl Preset {
    /// Active cells per instrument id.
    fn lanes(&self) -> [(&'static str, [bool; STARTER_BAR_STEPS]); 3] {
        let mut kick = [false; STARTER_BAR_STEPS];
        let mut snare = [false; STARTER_BAR_STEPS];
        let mut hats = [false; STARTER_BAR_STEPS];
        for step in 0..STARTER_BAR_STEPS {
            kick[step] = step % 4 == 0;
            snare[step] = step % 4 == 2;
            hats[step] = match self.hats {
                HatFeel::Straight => true,
                HatFeel::Eighths => step % 2 == 0,
            };
        }
        [("kick", kick), ("snare", snare), ("hihat_closed", hats)]
    }

    /// One bar laid out on `instruments`. Lanes are matched by instrument
    /// id; instruments the beat doesn't use stay blank.
    pub fn grid(&self, instruments: &[Instrument]) -> Grid {
        let lanes = self.lanes();
        let rows = instruments
            .iter()
            .map(|inst| {
                lanes
                    .iter()
                    .find(|(id, _)| *id == inst.id)
                    .map_or_else(|| Lane::from(vec![false; STARTER_BAR_STEPS]), |(_, cells)| Lane::from(&cells[..]))
            })
            .collect();
        Grid::from_lanes(rows)
    }
}
