//! Mappers between build targets and REAPI types

pub mod action;
pub mod command;
pub mod inputs;
pub mod result;

pub use action::{ActionBuilder, PreparedAction};
pub use command::{CommandBuilder, CommandInputs, ExecutionMode, TEST_COVERAGE_FILE, TEST_RESULTS_FILE};
pub use inputs::{InputFile, InputOrigin, InputResolver, ToolInput};
pub use result::{ActionOutput, ExecutionMetadata, ResultMapper};
