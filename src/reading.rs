use std::fmt;

/// The five quantities this meter model reports over SML
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Phase1,
    Phase2,
    Phase3,
    Overall,
    ElectricityMeter,
}

impl Quantity {
    /// All quantities in the fixed order used by [`Reading`]
    pub const ALL: [Quantity; 5] = [
        Quantity::Phase1,
        Quantity::Phase2,
        Quantity::Phase3,
        Quantity::Overall,
        Quantity::ElectricityMeter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Quantity::Phase1 => "phase_1",
            Quantity::Phase2 => "phase_2",
            Quantity::Phase3 => "phase_3",
            Quantity::Overall => "overall",
            Quantity::ElectricityMeter => "electricity_meter",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A snapshot of the five tracked quantities.
///
/// Each measurement may be absent, meaning it was not (or not successfully)
/// decoded. Instantaneous power is in W, the electricity meter in kWh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    values: [Option<f64>; 5],
}

impl Reading {
    /// Creates a reading with every measurement absent
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a reading with every measurement present
    pub fn new(phase_1: f64, phase_2: f64, phase_3: f64, overall: f64, electricity_meter: f64) -> Self {
        Self {
            values: [
                Some(phase_1),
                Some(phase_2),
                Some(phase_3),
                Some(overall),
                Some(electricity_meter),
            ],
        }
    }

    /// The reading handed out when no trustworthy value could be obtained:
    /// all five measurements present and zero.
    pub fn default_reading() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0, 0.0)
    }

    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        self.values[quantity.index()]
    }

    pub fn set(&mut self, quantity: Quantity, value: Option<f64>) {
        self.values[quantity.index()] = value;
    }

    /// Builder-style variant of [`Reading::set`]
    pub fn with(mut self, quantity: Quantity, value: Option<f64>) -> Self {
        self.set(quantity, value);
        self
    }

    /// Marks every measurement as absent again
    pub fn reset(&mut self) {
        self.values = [None; 5];
    }

    /// Iterates over `(quantity, value)` pairs in the fixed order
    pub fn iter(&self) -> impl Iterator<Item = (Quantity, Option<f64>)> + '_ {
        Quantity::ALL.iter().map(move |q| (*q, self.get(*q)))
    }

    /// True if any measurement is absent or negative
    pub fn is_invalid(&self) -> bool {
        self.values
            .iter()
            .any(|value| value.map_or(true, |v| v < 0.0))
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(value: Option<f64>) -> String {
            value.map_or_else(|| "None".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "L1={} L2={} L3={} Overall={} E={}",
            show(self.get(Quantity::Phase1)),
            show(self.get(Quantity::Phase2)),
            show(self.get(Quantity::Phase3)),
            show(self.get(Quantity::Overall)),
            show(self.get(Quantity::ElectricityMeter)),
        )
    }
}

/// Values derived from consecutive readings rather than decoded from a frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtendedReading {
    /// Energy consumed since the previous sampling window in Wh
    pub overall_consumption_wh: Option<f64>,
}

impl ExtendedReading {
    /// Derives the consumed energy from two electricity meter readings in kWh.
    /// Zero counters are treated like absent ones since they come from the
    /// fallback reading, and a counter running backwards yields nothing.
    pub fn from_meter_delta(previous_kwh: Option<f64>, current_kwh: Option<f64>) -> Self {
        let overall_consumption_wh = match (previous_kwh, current_kwh) {
            (Some(prev), Some(cur)) if prev > 0.0 && cur > 0.0 && cur >= prev => {
                Some((cur - prev) * 1000.0)
            }
            _ => None,
        };
        Self {
            overall_consumption_wh,
        }
    }
}

impl fmt::Display for ExtendedReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.overall_consumption_wh {
            Some(wh) => write!(f, "Overall(Wh)={wh}"),
            None => write!(f, "Overall(Wh)=None"),
        }
    }
}
