//! Graft Partition — support analysis, lowering and partitioning of dataflow graphs

pub mod oracle;
pub mod partitioner;
pub mod lowering;


pub use oracle::{CapabilityQuery, CapabilitySet, Exclusions, OpSupport, SupportOracle, SupportPreview, Verdict};
pub use partitioner::{Partition, PartitionKind, PartitionPolicy, partition, render_plan};
pub use lowering::{FuseProducerConsumer, LoweringPass, LoweringPipeline, LoweringReport, PassRecord};
