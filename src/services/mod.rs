pub mod illustrator;
pub mod ingest;
pub mod interactive;
pub mod layout;
pub mod llm;
pub mod narrative;
pub mod review;
pub mod stage;
pub mod visual;
pub mod workflow;
