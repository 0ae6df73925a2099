mod archive;
mod articles;
mod duplicates;
mod feeds;
mod folders;
mod maintenance;
mod metadata;
mod schema;
mod search;
mod types;

pub use duplicates::{group_candidates, similarity, AUTO_MERGE_THRESHOLD};
pub use metadata::backoff_window_secs;
pub use schema::Database;
pub use types::{
    ArchivedArticle, Article, ArticleStatus, DuplicateGroup, Feed, FeedMetadata, Folder,
    IndexConsistencyReport, NewItem, SearchFilters, SearchHit, StoreError, StoreStats,
};
