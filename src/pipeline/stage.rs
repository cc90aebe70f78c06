use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Progress of a pipeline, ordered. Builds move it to `Compiled`; renders
/// advance it as far as their passes got.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStage {
    #[default]
    None,
    Compiling,
    Compiled,
    HitAndNormals,
    Ao,
    ShadowsAndMaterials,
    Reflection,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 7] = [
        PipelineStage::None,
        PipelineStage::Compiling,
        PipelineStage::Compiled,
        PipelineStage::HitAndNormals,
        PipelineStage::Ao,
        PipelineStage::ShadowsAndMaterials,
        PipelineStage::Reflection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PipelineStage::None => "none",
            PipelineStage::Compiling => "compiling",
            PipelineStage::Compiled => "compiled",
            PipelineStage::HitAndNormals => "hitAndNormals",
            PipelineStage::Ao => "ao",
            PipelineStage::ShadowsAndMaterials => "shadowsAndMaterials",
            PipelineStage::Reflection => "reflection",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineStage::ALL
            .into_iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<&str> = PipelineStage::ALL.iter().map(|s| s.name()).collect();
                format!("unknown stage '{s}' (expected one of {})", names.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(PipelineStage::None < PipelineStage::Compiled);
        assert!(PipelineStage::HitAndNormals < PipelineStage::Ao);
        assert!(PipelineStage::ShadowsAndMaterials < PipelineStage::Reflection);
        assert_eq!(PipelineStage::default(), PipelineStage::None);
    }

    #[test]
    fn names_match_serde_and_parse_back() {
        for stage in PipelineStage::ALL {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.name()));
            assert_eq!(stage.name().parse::<PipelineStage>(), Ok(stage));
        }
        assert_eq!("AO".parse::<PipelineStage>(), Ok(PipelineStage::Ao));
        assert!("bloom".parse::<PipelineStage>().is_err());
    }
}
