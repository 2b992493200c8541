pub mod analysis_llm;
pub mod db;
pub mod video;

pub use analysis_llm::OpenAiAnalysisAdapter;
pub use db::DbAdapter;
pub use video::MeetRoomAdapter;
