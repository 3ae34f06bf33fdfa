mod intern_vit;
mod internvl;
mod language;

pub use intern_vit::InternVisionModel;
pub use internvl::{ChatResponse, History, InternVLChatModel};
pub use language::LanguageModel;
