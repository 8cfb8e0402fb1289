use crate::error::Result;

/// The upstream origin a response body is being rewritten for.
pub struct RewriteTarget<'a> {
    pub token: &'a str,
    pub domain: &'a str,
}

pub trait Rewriter {
    fn rewrite(&self, input: Vec<u8>, target: &RewriteTarget<'_>) -> Result<Vec<u8>>;
}
