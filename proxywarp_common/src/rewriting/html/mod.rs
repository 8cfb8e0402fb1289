pub mod html_rewriter;
pub mod script;
