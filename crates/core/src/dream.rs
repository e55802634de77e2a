//! Pure logic for the dream exploration loop: prompt mutation, parameter
//! jitter, and the session state machine.
//!
//! The controller that drives ticks lives in the engine crate; everything
//! here is deterministic given an RNG, so it can be tested without timers.

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::job::{GenerateParams, MAX_CFG, MAX_STEPS};

/// Textual modifiers appended to the base prompt during exploration.
/// Drawn uniformly without replacement; the draw count scales with
/// temperature.
pub const PROMPT_MODIFIERS: &[&str] = &[
    "dramatic lighting",
    "soft lighting",
    "golden hour",
    "cinematic",
    "highly detailed",
    "ethereal",
    "warm tones",
    "cool tones",
    "vibrant colors",
    "misty",
    "foggy",
    "hazy",
    "atmospheric",
    "sharp focus",
    "shallow depth of field",
    "bokeh",
    "film grain",
    "vintage",
    "modern",
];

/// Relative jitter applied to steps and guidance each tick.
const PARAM_JITTER: f64 = 0.2;

/// Dream session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DreamPhase {
    Idle,
    Starting,
    Dreaming,
    Stopping,
}

impl DreamPhase {
    /// Ticks are only produced while dreaming; a tick that fires during
    /// `Stopping` is dropped, not submitted.
    pub fn accepts_ticks(self) -> bool {
        self == DreamPhase::Dreaming
    }
}

/// Steerable knobs, swapped atomically by `dream:guide`.
#[derive(Debug, Clone)]
pub struct DreamGuidance {
    pub base_prompt: String,
    /// Exploration randomness in `[0, 1]`.
    pub temperature: f64,
}

/// Append `0..=max_mods` random modifiers to the base prompt, where the
/// cap scales with temperature. Temperature zero always returns the base
/// prompt unchanged.
pub fn mutate_prompt(base: &str, temperature: f64, rng: &mut impl Rng) -> String {
    let temperature = temperature.clamp(0.0, 1.0);
    let max_mods = (3.0 * temperature).floor() as usize + usize::from(temperature > 0.0);
    if max_mods == 0 {
        return base.to_string();
    }
    let count = rng.random_range(0..=max_mods.min(PROMPT_MODIFIERS.len()));
    if count == 0 {
        return base.to_string();
    }

    let picks: Vec<&&str> = PROMPT_MODIFIERS.choose_multiple(rng, count).collect();
    let mut out = String::from(base);
    for pick in picks {
        out.push_str(", ");
        out.push_str(pick);
    }
    out
}

/// Jitter a positive integer parameter by ±20%, clamped to `lo..=hi`.
pub fn jitter_steps(steps: u32, rng: &mut impl Rng) -> u32 {
    let factor = 1.0 + rng.random_range(-PARAM_JITTER..=PARAM_JITTER);
    ((steps as f64 * factor).round() as u32).clamp(1, MAX_STEPS)
}

/// Jitter guidance by ±20%, clamped to the accepted range.
pub fn jitter_guidance(cfg: f64, rng: &mut impl Rng) -> f64 {
    let factor = 1.0 + rng.random_range(-PARAM_JITTER..=PARAM_JITTER);
    (cfg * factor).clamp(0.0, MAX_CFG)
}

/// Build the next tick's generation parameters from a template: mutated
/// prompt, jittered steps and guidance, and a fresh random seed.
pub fn next_tick_params(
    template: &GenerateParams,
    guidance: &DreamGuidance,
    rng: &mut impl Rng,
) -> GenerateParams {
    let mut params = template.clone();
    params.prompt = mutate_prompt(&guidance.base_prompt, guidance.temperature, rng);
    params.steps = jitter_steps(template.steps, rng);
    params.cfg = jitter_guidance(template.cfg, rng);
    params.seed = rng.random();
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    use crate::job::GenerateDefaults;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn zero_temperature_never_mutates() {
        let mut rng = rng();
        for _ in 0..50 {
            assert_eq!(mutate_prompt("sunset", 0.0, &mut rng), "sunset");
        }
    }

    #[test]
    fn mutation_preserves_base_prompt() {
        let mut rng = rng();
        for _ in 0..50 {
            let mutated = mutate_prompt("sunset over water", 1.0, &mut rng);
            assert!(mutated.starts_with("sunset over water"));
        }
    }

    #[test]
    fn high_temperature_eventually_appends_modifiers() {
        let mut rng = rng();
        let appended = (0..50)
            .map(|_| mutate_prompt("base", 1.0, &mut rng))
            .any(|p| p.len() > "base".len());
        assert!(appended);
    }

    #[test]
    fn appended_modifiers_come_from_the_list() {
        let mut rng = rng();
        for _ in 0..50 {
            let mutated = mutate_prompt("base", 1.0, &mut rng);
            let Some(rest) = mutated.strip_prefix("base") else {
                panic!("base prompt lost");
            };
            for modifier in rest.split(", ").filter(|m| !m.is_empty()) {
                assert!(PROMPT_MODIFIERS.contains(&modifier), "unknown modifier {modifier}");
            }
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = rng();
        for _ in 0..200 {
            let steps = jitter_steps(30, &mut rng);
            assert!((24..=36).contains(&steps), "steps {steps} out of ±20%");

            let cfg = jitter_guidance(7.5, &mut rng);
            assert!((5.9..=9.1).contains(&cfg), "cfg {cfg} out of ±20%");
        }
    }

    #[test]
    fn jitter_clamps_at_limits() {
        let mut rng = rng();
        for _ in 0..50 {
            assert!(jitter_steps(1, &mut rng) >= 1);
            assert!(jitter_steps(MAX_STEPS, &mut rng) <= MAX_STEPS);
            assert!(jitter_guidance(MAX_CFG, &mut rng) <= MAX_CFG);
        }
    }

    #[test]
    fn tick_params_get_fresh_seed_and_guided_prompt() {
        let template = GenerateParams::from_value(
            &json!({"prompt": "ignored", "seed": 1u64, "steps": 30, "cfg": 7.5}),
            &GenerateDefaults::default(),
        )
        .unwrap();
        let guidance = DreamGuidance {
            base_prompt: "ocean".to_string(),
            temperature: 0.5,
        };

        let mut rng = rng();
        let a = next_tick_params(&template, &guidance, &mut rng);
        let b = next_tick_params(&template, &guidance, &mut rng);

        assert!(a.prompt.contains("ocean"));
        assert!(b.prompt.contains("ocean"));
        assert_ne!(a.seed, b.seed);
        assert_ne!(a.seed, template.seed);
    }

    #[test]
    fn phase_tick_acceptance() {
        assert!(DreamPhase::Dreaming.accepts_ticks());
        assert!(!DreamPhase::Stopping.accepts_ticks());
        assert!(!DreamPhase::Idle.accepts_ticks());
        assert!(!DreamPhase::Starting.accepts_ticks());
    }
}
