pub mod chat;
pub mod console;
pub mod init;
pub mod rag;
pub mod serve;
