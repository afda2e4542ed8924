use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::config::EffectsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn from_hex(code: &str) -> Option<Self> {
        if !is_hex_code(code) {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&code[i..i + 2], 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self::new(rng.gen(), rng.gen(), rng.gen())
    }

    pub fn to_hex(self) -> String {
        format!("{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    // CIE 1931 chromaticity for the wide-gamut Hue lamps.
    pub fn to_xy(self) -> (f64, f64) {
        fn linear(channel: u8) -> f64 {
            let v = channel as f64 / 255.0;
            if v > 0.04045 {
                ((v + 0.055) / 1.055).powf(2.4)
            } else {
                v / 12.92
            }
        }

        let (r, g, b) = (linear(self.r), linear(self.g), linear(self.b));
        let x = r * 0.664_511 + g * 0.154_324 + b * 0.162_028;
        let y = r * 0.283_881 + g * 0.668_433 + b * 0.047_685;
        let z = r * 0.000_088 + g * 0.072_310 + b * 0.986_039;
        let sum = x + y + z;
        if sum <= f64::EPSILON {
            // black has no chromaticity; use the D65 white point
            return (0.3127, 0.3290);
        }
        (round4(x / sum), round4(y / sum))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.to_hex())
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub fn is_hex_code(code: &str) -> bool {
    code.len() == 6 && code.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn clean_input(input: &str) -> String {
    input.trim().to_lowercase().replace('#', "")
}

#[derive(Debug, Error)]
pub enum ColorError {
    #[error("invalid color '{value}' for '{name}'")]
    InvalidHex { name: String, value: String },
    #[error("palette '{0}' is not defined")]
    UnknownPalette(String),
    #[error("palette '{0}' has no colors")]
    EmptyPalette(String),
    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Random,
    Named,
    Hex,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ColorTable {
    names: BTreeMap<String, Rgb>,
    hex_suffix: Regex,
}

impl ColorTable {
    pub fn new(names: &BTreeMap<String, String>) -> Result<Self, ColorError> {
        let names = names
            .iter()
            .map(|(name, code)| {
                Rgb::from_hex(code.trim_start_matches('#'))
                    .map(|rgb| (name.to_lowercase(), rgb))
                    .ok_or_else(|| ColorError::InvalidHex {
                        name: name.clone(),
                        value: code.clone(),
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            names,
            hex_suffix: Regex::new("[0-9a-fA-F]{6}$")?,
        })
    }

    pub fn resolve(&self, input: &str) -> (Rgb, Resolution) {
        if input == "random" {
            return (Rgb::random(), Resolution::Random);
        }
        if let Some(rgb) = self.names.get(input) {
            return (*rgb, Resolution::Named);
        }
        if let Some(rgb) = self
            .hex_suffix
            .find(input)
            .and_then(|m| Rgb::from_hex(m.as_str()))
        {
            return (rgb, Resolution::Hex);
        }
        (Rgb::random(), Resolution::Fallback)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    pub name: String,
    pub colors: Vec<Rgb>,
}

#[derive(Debug, Clone)]
pub struct PaletteBook {
    palettes: BTreeMap<String, Palette>,
    default: Palette,
}

impl PaletteBook {
    pub fn from_config(effects: &EffectsConfig) -> Result<Self, ColorError> {
        let mut palettes = BTreeMap::new();
        for (name, codes) in &effects.palettes {
            if codes.is_empty() {
                return Err(ColorError::EmptyPalette(name.clone()));
            }
            let colors = codes
                .iter()
                .map(|code| {
                    Rgb::from_hex(code.trim_start_matches('#')).ok_or_else(|| {
                        ColorError::InvalidHex {
                            name: name.clone(),
                            value: code.clone(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let key = name.to_lowercase();
            palettes.insert(key.clone(), Palette { name: key, colors });
        }

        let default = palettes
            .get(&effects.default_palette.to_lowercase())
            .cloned()
            .ok_or_else(|| ColorError::UnknownPalette(effects.default_palette.clone()))?;
        Ok(Self { palettes, default })
    }

    pub fn get(&self, name: &str) -> Option<&Palette> {
        self.palettes.get(&name.to_lowercase())
    }

    pub fn default_palette(&self) -> &Palette {
        &self.default
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.palettes.keys().map(String::as_str)
    }
}
