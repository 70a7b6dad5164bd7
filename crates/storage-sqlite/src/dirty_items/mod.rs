mod model;
mod repository;

pub use model::DirtyItemDB;
pub use repository::DirtyItemRepository;
