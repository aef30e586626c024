pub mod retriever;
pub mod vector_store;

pub use retriever::{LexicalRanker, RankedTable, SchemaContext, SchemaRetriever};
