//! SeaORM entity models

mod chat_log;
mod faq;

pub use faq::{
    Entity as FaqEntity,
    Model as Faq,
    ActiveModel as FaqActiveModel,
    Column as FaqColumn,
};

pub use chat_log::{
    Entity as ChatLogEntity,
    Model as ChatLog,
    ActiveModel as ChatLogActiveModel,
    Column as ChatLogColumn,
};
