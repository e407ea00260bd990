pub(crate) mod chunk_pool;
pub(crate) mod error;
pub(crate) mod free_list;
pub(crate) mod stats;
pub(crate) mod sys;
pub(crate) mod tiered;
