//! Runtime configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::processor::ProcessorKind;

/// The most replicas a stage may have, bounded by the single byte EOF ttl on the wire.
pub const MAX_REPLICAS: u32 = 256;
/// The gateway dataset kind of airport records.
pub const KIND_AIRPORTS: u8 = 1;
/// The gateway dataset kind of flight records.
pub const KIND_FLIGHTS: u8 = 2;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port which client network traffic is to use.
    #[serde(default = "Config::default_gateway_port")]
    pub gateway_port: u16,
    /// The port on which metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The directory holding the recovery log of every replica and the gateway's client ID counter.
    #[serde(default = "Config::default_storage_data_path")]
    pub storage_data_path: String,
    /// The path to the YAML topology of the pipeline.
    #[serde(default = "Config::default_topology_path")]
    pub topology_path: String,

    /// The capacity of each broker queue.
    #[serde(default = "Config::default_channel_capacity")]
    pub channel_capacity: usize,
    /// The base delay before an undrained EOF token is passed on again.
    #[serde(default = "Config::default_eof_requeue_delay_ms")]
    pub eof_requeue_delay_ms: u64,
    /// Seconds of client silence after which the gateway closes the connection.
    #[serde(default = "Config::default_client_read_timeout_secs")]
    pub client_read_timeout_secs: u64,
    /// The field delimiter of records.
    #[serde(default = "Config::default_delimiter")]
    pub delimiter: char,

    /// The pipeline topology, loaded from `topology_path`.
    #[serde(skip, default)]
    pub topology: Topology,
}

impl Config {
    /// Create a new config instance.
    ///
    /// The runtime environment is parsed, after which the topology is loaded from the file it
    /// names and validated.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.topology = Topology::from_file(Path::new(&config.topology_path))?;
        Ok(config)
    }

    /// The base delay before an undrained EOF token is passed on again.
    pub fn eof_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.eof_requeue_delay_ms)
    }

    /// The client read timeout of the gateway.
    pub fn client_read_timeout(&self) -> Duration {
        Duration::from_secs(self.client_read_timeout_secs)
    }

    /// The path of the recovery log of the given stage replica.
    pub fn log_path(&self, stage: &str, index: u32) -> PathBuf {
        PathBuf::from(&self.storage_data_path).join(format!("{}-{}.log", stage, index))
    }

    /// The path of the gateway's client ID counter.
    pub fn client_ids_path(&self) -> PathBuf {
        PathBuf::from(&self.storage_data_path).join("gateway.ids")
    }

    fn default_rust_log() -> String {
        "info".into()
    }
    fn default_gateway_port() -> u16 {
        12345
    }
    fn default_metrics_port() -> u16 {
        7002
    }
    fn default_storage_data_path() -> String {
        "/usr/local/stagehand/log".into()
    }
    fn default_topology_path() -> String {
        "/usr/local/stagehand/topology.yaml".into()
    }
    fn default_channel_capacity() -> usize {
        1000
    }
    fn default_eof_requeue_delay_ms() -> u64 {
        50
    }
    fn default_client_read_timeout_secs() -> u64 {
        30
    }
    fn default_delimiter() -> char {
        ','
    }

    /// Create a config for tests, with its storage in a fresh temp dir.
    #[cfg(test)]
    pub fn new_test(topology: Topology) -> Result<(Self, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "".into(),
            gateway_port: 0,
            metrics_port: 0,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            topology_path: "".into(),
            channel_capacity: 100,
            eof_requeue_delay_ms: 1,
            client_read_timeout_secs: 5,
            delimiter: ',',
            topology,
        };
        Ok((config, tmpdir))
    }
}

/// The pipeline topology.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Topology {
    /// The client facing edge of the pipeline.
    pub gateway: GatewaySpec,
    /// The worker stages of the pipeline.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// The client facing edge of the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct GatewaySpec {
    /// Where each dataset kind sent by clients goes.
    pub inputs: Vec<GatewayInput>,
    /// Where results for clients are collected.
    pub results: ResultsSpec,
}

/// A dataset kind accepted by the gateway.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GatewayInput {
    /// The kind byte of the dataset's frames.
    pub kind: u8,
    /// Where the dataset's record batches are published.
    pub output: OutputSpec,
}

/// The collection point of results.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResultsSpec {
    /// The queue into which result producing stages publish.
    pub queue: String,
    /// The number of stages publishing into the queue, each of which sends its own EOF.
    #[serde(default = "default_one")]
    pub sources: u32,
}

impl Default for ResultsSpec {
    fn default() -> Self {
        Self {
            queue: "results".into(),
            sources: 1,
        }
    }
}

/// A worker stage of the pipeline.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The number of replicas of the stage.
    #[serde(default = "default_one")]
    pub replicas: u32,
    /// Where the stage reads from.
    pub input: InputSpec,
    /// The positional field names of input records, if structured.
    #[serde(default)]
    pub input_fields: Option<Vec<String>>,
    /// Where the stage publishes its outputs, if anywhere.
    #[serde(default)]
    pub output: Option<OutputSpec>,
    /// The positional field names of output records, if structured.
    #[serde(default)]
    pub output_fields: Option<Vec<String>>,
    /// The processor of the stage.
    pub processor: ProcessorKind,
    /// Do not propagate EOF downstream once the stage finishes a client.
    #[serde(default)]
    pub suppress_eof: bool,
    /// The number of upstream EOFs which end a client's input.
    #[serde(default = "default_one")]
    pub eof_sources: u32,
}

/// The input of a stage.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSpec {
    /// A queue shared by the replicas.
    Queue { name: String },
    /// A fanout exchange, read through a queue shared by the replicas.
    Fanout { exchange: String },
    /// A topic exchange, read through a private queue per replica bound with its index.
    Topic { exchange: String },
}

/// The output of a stage.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputSpec {
    Queue { name: String },
    Fanout { exchange: String },
    /// Records are partitioned over `partitions` routing keys by their `key_field`.
    Topic { exchange: String, key_field: String, partitions: u32 },
}

fn default_one() -> u32 {
    1
}

impl StageSpec {
    /// The name of the queue the given replica of this stage reads its input from.
    pub fn input_queue(&self, index: u32) -> String {
        match &self.input {
            InputSpec::Queue { name } => name.clone(),
            InputSpec::Fanout { .. } => format!("{}.input", self.name),
            InputSpec::Topic { .. } => format!("{}.input.{}", self.name, index),
        }
    }
}

impl Topology {
    /// Load and validate the topology in the given YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("error reading topology file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a YAML topology.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let topology: Self = serde_yaml::from_str(raw).context("error parsing topology")?;
        topology.validate()?;
        Ok(topology)
    }

    /// The stage collecting results for the gateway.
    pub fn results_stage(&self) -> StageSpec {
        StageSpec {
            name: "results".into(),
            replicas: 1,
            input: InputSpec::Queue {
                name: self.gateway.results.queue.clone(),
            },
            input_fields: None,
            output: None,
            output_fields: None,
            processor: ProcessorKind::Results,
            suppress_eof: true,
            eof_sources: self.gateway.results.sources,
        }
    }

    /// Validate the topology, returning an `AppError::InvalidInput` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut topic_readers: HashMap<&str, &StageSpec> = HashMap::new();
        for stage in self.stages.iter() {
            if stage.name.is_empty() || stage.name == "results" {
                bail!(AppError::InvalidInput(format!("invalid stage name {:?}", stage.name)));
            }
            if !names.insert(stage.name.as_str()) {
                bail!(AppError::InvalidInput(format!("duplicate stage name {}", stage.name)));
            }
            if stage.replicas == 0 || stage.replicas > MAX_REPLICAS {
                bail!(AppError::InvalidInput(format!(
                    "stage {} has {} replicas, must be between 1 and {}",
                    stage.name, stage.replicas, MAX_REPLICAS
                )));
            }
            if stage.eof_sources == 0 {
                bail!(AppError::InvalidInput(format!("stage {} must have at least 1 EOF source", stage.name)));
            }
            if matches!(stage.processor, ProcessorKind::Results) {
                bail!(AppError::InvalidInput(format!("stage {} may not use the results processor", stage.name)));
            }
            if let InputSpec::Topic { exchange } = &stage.input {
                if topic_readers.insert(exchange.as_str(), stage).is_some() {
                    bail!(AppError::InvalidInput(format!("topic exchange {} is read by more than one stage", exchange)));
                }
            }
        }

        let outputs = self
            .stages
            .iter()
            .filter_map(|stage| stage.output.as_ref().map(|output| (stage.name.as_str(), output)));
        for (owner, output) in outputs {
            if let OutputSpec::Topic { exchange, partitions, .. } = output {
                let reader = match topic_readers.get(exchange.as_str()) {
                    Some(reader) => reader,
                    None => bail!(AppError::InvalidInput(format!("topic exchange {} of {} has no reading stage", exchange, owner))),
                };
                if *partitions != reader.replicas {
                    bail!(AppError::InvalidInput(format!(
                        "{} partitions topic exchange {} {} ways, but stage {} has {} replicas",
                        owner, exchange, partitions, reader.name, reader.replicas
                    )));
                }
            }
        }

        let mut kinds = HashSet::new();
        for input in self.gateway.inputs.iter() {
            if input.kind != KIND_AIRPORTS && input.kind != KIND_FLIGHTS {
                bail!(AppError::InvalidInput(format!("unknown gateway dataset kind {}", input.kind)));
            }
            if !kinds.insert(input.kind) {
                bail!(AppError::InvalidInput(format!("duplicate gateway dataset kind {}", input.kind)));
            }
            // Client batches are forwarded as is, without records to partition by.
            if matches!(input.output, OutputSpec::Topic { .. }) {
                bail!(AppError::InvalidInput(format!("gateway dataset kind {} may not publish to a topic exchange", input.kind)));
            }
        }
        if self.gateway.results.queue.is_empty() || self.gateway.results.sources == 0 {
            bail!(AppError::InvalidInput("gateway results need a queue and at least 1 source".into()));
        }
        Ok(())
    }
}
