//! Lautstärke-Glättung für die UI-Visualisierung
//!
//! Exponentielle Glättung des RMS-Werts pro Frame. Der Boost-Faktor
//! hebt leise Sprache an, damit die Anzeige sichtbar ausschlägt.

/// Abklingfaktor des bisherigen Pegels
const DECAY: f32 = 0.8;

/// Boost-Faktor für den neuen RMS-Wert (leise Sprache sichtbar machen)
const BOOST: f32 = 2.0;

/// Geglätteter Lautstärke-Pegel in [0, 1]
#[derive(Debug, Clone, Default)]
pub struct VolumeMeter {
    level: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self { level: 0.0 }
    }

    /// Verrechnet einen neuen RMS-Wert und gibt den geglätteten Pegel zurück.
    ///
    /// `level' = clamp(level * 0.8 + rms * 2.0, 0, 1)`
    pub fn update(&mut self, rms: f32) -> f32 {
        self.level = (self.level * DECAY + rms * BOOST).clamp(0.0, 1.0);
        self.level
    }

    /// Aktueller Pegel
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Zurücksetzen auf 0 (bei Teardown)
    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_startet_bei_null() {
        assert_eq!(VolumeMeter::new().level(), 0.0);
    }

    #[test]
    fn volume_deterministisch() {
        let inputs = [0.1, 0.05, 0.3, 0.0, 0.2];

        let mut a = VolumeMeter::new();
        let mut b = VolumeMeter::new();
        let seq_a: Vec<f32> = inputs.iter().map(|&r| a.update(r)).collect();
        let seq_b: Vec<f32> = inputs.iter().map(|&r| b.update(r)).collect();

        assert_eq!(seq_a, seq_b, "Gleiche Eingaben müssen gleiche Pegel ergeben");
    }

    #[test]
    fn volume_bleibt_in_grenzen() {
        let mut meter = VolumeMeter::new();
        for _ in 0..100 {
            let level = meter.update(1.0);
            assert!((0.0..=1.0).contains(&level));
        }
        // Dauerhaft voller Pegel sättigt bei 1.0
        assert_eq!(meter.level(), 1.0);
    }

    #[test]
    fn volume_glaettung() {
        let mut meter = VolumeMeter::new();
        let first = meter.update(0.1);
        assert!((first - 0.2).abs() < 1e-6, "0 * 0.8 + 0.1 * 2.0 = 0.2");
        let second = meter.update(0.1);
        assert!((second - 0.36).abs() < 1e-6, "0.2 * 0.8 + 0.1 * 2.0 = 0.36");
    }

    #[test]
    fn volume_klingt_ab() {
        let mut meter = VolumeMeter::new();
        meter.update(0.4);
        let high = meter.level();
        meter.update(0.0);
        assert!(meter.level() < high, "Ohne Eingangspegel muss der Wert fallen");
    }

    #[test]
    fn volume_reset() {
        let mut meter = VolumeMeter::new();
        meter.update(0.5);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }
}
