//! Artifact references and the naming contract between steps.
//!
//! Steps never return values to the driver. Each one registers its output in the
//! artifact store under a fixed name, and later steps ask for that name with an
//! alias such as `latest`. The names below are that contract.

use std::fmt;

use crate::step::Step;

pub const RAW_SAMPLE: &str = "sample.csv";
pub const CLEAN_SAMPLE: &str = "clean_sample.csv";
pub const TRAINVAL_DATA: &str = "trainval_data.csv";
pub const TEST_DATA: &str = "test_data.csv";
pub const MODEL_EXPORT: &str = "random_forest_export.csv";

pub const LATEST: &str = "latest";
pub const PROD: &str = "prod";

/// Which step registers each artifact name.
const PRODUCERS: &[(&str, Step)] = &[
    (RAW_SAMPLE, Step::Download),
    (CLEAN_SAMPLE, Step::BasicCleaning),
    (TRAINVAL_DATA, Step::DataSplit),
    (TEST_DATA, Step::DataSplit),
    (MODEL_EXPORT, Step::TrainRandomForest),
];

/// The step that produces `name`, if any step in this pipeline does.
pub fn producer_of(name: &str) -> Option<Step> {
    PRODUCERS
        .iter()
        .find(|(artifact, _)| *artifact == name)
        .map(|(_, step)| *step)
}

/// A `<name>:<version-or-alias>` reference into the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub name: String,
    pub alias: String,
}

impl ArtifactRef {
    pub fn new(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_string(),
            alias: alias.to_string(),
        }
    }

    /// Parse a reference, splitting at the last `:`.
    ///
    /// Names may carry an `entity/project/` prefix, so only the alias part is
    /// constrained to follow the final colon.
    pub fn parse(reference: &str) -> Result<Self, &'static str> {
        if reference.chars().any(char::is_whitespace) {
            return Err("contains whitespace");
        }
        let (name, alias) = reference
            .rsplit_once(':')
            .ok_or("missing ':<version-or-alias>' suffix")?;
        if name.is_empty() {
            return Err("empty artifact name");
        }
        if alias.is_empty() {
            return Err("empty version or alias");
        }
        Ok(Self::new(name, alias))
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.alias)
    }
}

/// How a consumed artifact will be available to the step that reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// An earlier step in this run registers it.
    ProducedThisRun { producer: Step },
    /// Its producer is not running; the store must already hold it.
    ExpectedInStore { producer: Option<Step> },
}

/// Resolve where `input`, consumed by `consumer`, comes from given which steps run.
pub fn handoff_for(input: &ArtifactRef, consumer: Step, running: &[Step]) -> Handoff {
    match producer_of(&input.name) {
        Some(producer) if producer < consumer && running.contains(&producer) => {
            Handoff::ProducedThisRun { producer }
        }
        producer => Handoff::ExpectedInStore { producer },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::ParameterBinder;
    use crate::config::ConfigTree;

    #[test]
    fn test_parse_simple_reference() {
        let r = ArtifactRef::parse("sample.csv:latest").unwrap();
        assert_eq!(r.name, "sample.csv");
        assert_eq!(r.alias, "latest");
        assert_eq!(r.to_string(), "sample.csv:latest");
    }

    #[test]
    fn test_parse_qualified_reference() {
        let r = ArtifactRef::parse("team/nyc_airbnb/random_forest_export:v3").unwrap();
        assert_eq!(r.name, "team/nyc_airbnb/random_forest_export");
        assert_eq!(r.alias, "v3");
    }

    #[test]
    fn test_parse_rejects_malformed_references() {
        assert_eq!(
            ArtifactRef::parse("sample.csv"),
            Err("missing ':<version-or-alias>' suffix")
        );
        assert_eq!(ArtifactRef::parse(":latest"), Err("empty artifact name"));
        assert_eq!(ArtifactRef::parse("sample.csv:"), Err("empty version or alias"));
        assert_eq!(
            ArtifactRef::parse("sample .csv:latest"),
            Err("contains whitespace")
        );
    }

    #[test]
    fn test_producers() {
        assert_eq!(producer_of(RAW_SAMPLE), Some(Step::Download));
        assert_eq!(producer_of(TEST_DATA), Some(Step::DataSplit));
        assert_eq!(producer_of("unknown.csv"), None);
    }

    #[test]
    fn test_every_consumed_artifact_is_produced_by_an_earlier_step() {
        let config = ConfigTree::parse(crate::config::tests::SAMPLE_CONFIG).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let binder = ParameterBinder::new(&config, scratch.path(), scratch.path());

        for step in Step::CANONICAL {
            let invocation = binder.bind(step).unwrap();
            for input in invocation.inputs.iter().map(|i| &i.artifact) {
                let producer = producer_of(&input.name)
                    .unwrap_or_else(|| panic!("{} consumes unproduced {}", step, input));
                assert!(
                    producer < step,
                    "{} consumes {} from later step {}",
                    step,
                    input,
                    producer
                );
            }
        }
    }

    #[test]
    fn test_handoff_produced_this_run() {
        let input = ArtifactRef::new(CLEAN_SAMPLE, LATEST);
        let running = [Step::BasicCleaning, Step::DataCheck];
        assert_eq!(
            handoff_for(&input, Step::DataCheck, &running),
            Handoff::ProducedThisRun {
                producer: Step::BasicCleaning
            }
        );
    }

    #[test]
    fn test_handoff_expected_in_store_when_producer_skipped() {
        let input = ArtifactRef::new(TRAINVAL_DATA, LATEST);
        let running = [Step::TrainRandomForest];
        assert_eq!(
            handoff_for(&input, Step::TrainRandomForest, &running),
            Handoff::ExpectedInStore {
                producer: Some(Step::DataSplit)
            }
        );
    }
}
