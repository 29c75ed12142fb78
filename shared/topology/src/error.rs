use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("{name} must be positive, got 0")]
    NonPositive { name: &'static str },

    #[error(
        "depth {depth} gives model_width {model_width}, which does not split evenly into {head_count} heads; use an even depth"
    )]
    Parity {
        depth: u32,
        model_width: u64,
        head_count: u64,
    },

    #[error(
        "total_batch_size {total_batch_size} is not divisible by tokens_per_world_microbatch {tokens_per_world_microbatch} \
         (device_batch_size {device_batch_size} x sequence_length {sequence_length} x world_size {world_size}); {}",
        nearest_totals(.nearest_below, .nearest_above)
    )]
    NotDivisible {
        total_batch_size: u64,
        tokens_per_world_microbatch: u128,
        device_batch_size: u32,
        sequence_length: u32,
        world_size: u64,
        nearest_below: Option<u64>,
        nearest_above: Option<u64>,
    },

    #[error("{what} does not fit in 64 bits")]
    Overflow { what: &'static str },

    #[error("{name} must be finite and positive, got {value}")]
    InvalidHorizon { name: &'static str, value: f64 },

    #[error("a horizon of {target} rounds to zero optimizer steps at total_batch_size {total_batch_size}")]
    EmptyHorizon { target: String, total_batch_size: u64 },

    #[error(
        "unknown preset '{0}'. Known presets are: {known}",
        known = crate::Preset::NAMES.join(", ")
    )]
    UnknownPreset(String),

    #[error("could not encode the plan: {0}")]
    Encode(#[from] postcard::Error),
}

fn nearest_totals(below: &Option<u64>, above: &Option<u64>) -> String {
    match (*below, *above) {
        (Some(below), Some(above)) => format!("nearest valid totals are {below} and {above}"),
        (None, Some(above)) | (Some(above), None) => format!("nearest valid total is {above}"),
        (None, None) => "no valid total exists for this microbatch".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_totals_reads_naturally() {
        assert_eq!(
            nearest_totals(&Some(327680), &Some(655360)),
            "nearest valid totals are 327680 and 655360"
        );
        assert_eq!(
            nearest_totals(&None, &Some(327680)),
            "nearest valid total is 327680"
        );
    }
}
