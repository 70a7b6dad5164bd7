mod model;
mod repository;

pub use model::MetaDB;
pub use repository::LocalEntityRepository;
