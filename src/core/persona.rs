//! Persona resolution: maps a configured model name to the Central scale
//! it represents. Purely cosmetic; the banner and diagnostics use it.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Persona {
    pub central_name: &'static str,
    pub scale: &'static str,
    pub variant_name: &'static str,
    pub model_target: &'static str,
    pub tagline: &'static str,
}

const SCALES: &[Persona] = &[
    Persona {
        central_name: "nano-nox",
        scale: "nano",
        variant_name: "Nano",
        model_target: "qwen2.5:0.5b",
        tagline: "Pocket-sized; fast answers over deep ones",
    },
    Persona {
        central_name: "micro-nox",
        scale: "micro",
        variant_name: "Micro",
        model_target: "qwen2.5:1.5b",
        tagline: "Small enough for a phone, big enough to be useful",
    },
    Persona {
        central_name: "milli-nox",
        scale: "milli",
        variant_name: "Milli",
        model_target: "qwen2.5:3b",
        tagline: "The daily driver",
    },
    Persona {
        central_name: "centi-nox",
        scale: "centi",
        variant_name: "Centi",
        model_target: "qwen2.5:7b",
        tagline: "Heavyweight local reasoning",
    },
];

/// Resolve the persona for a configured model. `NOX_SCALE` overrides the
/// mapping; unknown models fall back to the default scale.
pub fn resolve_persona(model: &str) -> &'static Persona {
    if let Ok(scale) = std::env::var("NOX_SCALE")
        && let Some(persona) = by_scale(scale.trim())
    {
        return persona;
    }

    let model = model.trim().to_lowercase();
    SCALES
        .iter()
        .find(|p| {
            p.central_name == model || p.scale == model || p.model_target == model
        })
        .unwrap_or(default_persona())
}

fn by_scale(scale: &str) -> Option<&'static Persona> {
    let scale = scale.to_lowercase();
    SCALES
        .iter()
        .find(|p| p.scale == scale || p.central_name == scale)
}

fn default_persona() -> &'static Persona {
    &SCALES[3] // centi
}
