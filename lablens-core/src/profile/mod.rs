pub mod frequency;
pub mod numeric;

pub use frequency::{FrequencyCounter, FrequencyEntry};
pub use numeric::{NumericAccumulator, NumericSummary};
