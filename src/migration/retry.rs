//! Per-token retry bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::Error;
use crate::types::{NodeId, Token, TokenGroup};

/// Outcome of planning retries for a batch of failed tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPlan {
    /// Fresh executors to create: alternate source → tokens.
    Retry(BTreeMap<NodeId, BTreeSet<Token>>),
    /// A token cannot be retried; its group must be aborted with this error.
    Exhausted(Error),
}

/// Tokens that failed against their source, and the sources already tried.
#[derive(Debug, Default)]
pub struct RetrySet {
    max_retries: u32,
    tried: HashMap<Token, BTreeSet<NodeId>>,
    attempts: HashMap<Token, u32>,
    groups: BTreeSet<TokenGroup>,
}

impl RetrySet {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Remember that `source` is serving (or has served) `token`.
    pub fn mark_tried(&mut self, token: Token, source: NodeId) {
        self.tried.entry(token).or_default().insert(source);
    }

    /// Groups with at least one failed token.
    pub fn groups(&self) -> &BTreeSet<TokenGroup> {
        &self.groups
    }

    pub fn contains(&self, group: TokenGroup) -> bool {
        self.groups.contains(&group)
    }

    /// Retries spent on `token`.
    pub fn attempts(&self, token: Token) -> u32 {
        self.attempts.get(&token).copied().unwrap_or(0)
    }

    /// Next replica of `token` not yet tried, skipping `local`.
    pub fn next_source(&self, token: Token, replicas: &[NodeId], local: NodeId) -> Option<NodeId> {
        let tried = self.tried.get(&token);
        replicas
            .iter()
            .copied()
            .find(|n| *n != local && !tried.is_some_and(|t| t.contains(n)))
    }

    /// Plan alternate sources for the tokens of `group` that failed against
    /// `source`. `replicas` yields each token's ordered replica list.
    pub fn plan<'a>(
        &mut self,
        group: TokenGroup,
        source: NodeId,
        failed: &BTreeMap<Token, Error>,
        replicas: impl Fn(Token) -> &'a [NodeId],
        local: NodeId,
    ) -> RetryPlan {
        let mut plan: BTreeMap<NodeId, BTreeSet<Token>> = BTreeMap::new();

        for (token, err) in failed {
            self.groups.insert(group);
            self.mark_tried(*token, source);

            if !err.is_retryable() {
                return RetryPlan::Exhausted(err.clone());
            }

            let attempts = self.attempts.entry(*token).or_insert(0);
            *attempts += 1;
            if *attempts > self.max_retries {
                tracing::warn!(%group, %token, attempts = *attempts, "Retries exhausted");
                return RetryPlan::Exhausted(Error::RetriesExhausted {
                    group,
                    token: *token,
                });
            }

            match self.next_source(*token, replicas(*token), local) {
                Some(next) => {
                    self.mark_tried(*token, next);
                    plan.entry(next).or_default().insert(*token);
                }
                None => {
                    tracing::warn!(%group, %token, "No alternate source left");
                    return RetryPlan::Exhausted(Error::RetriesExhausted {
                        group,
                        token: *token,
                    });
                }
            }
        }
        RetryPlan::Retry(plan)
    }

    /// Forget a group's retries once it completes or is aborted.
    pub fn clear_group(&mut self, group: TokenGroup, group_bits: u32) {
        self.groups.remove(&group);
        for token in group.tokens(group_bits) {
            self.tried.remove(&token);
            self.attempts.remove(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(token: u32, source: NodeId) -> BTreeMap<Token, Error> {
        [(
            Token(token),
            Error::SourceNotReady {
                node: source,
                token: Token(token),
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_alternate_source_skips_failed_and_local() {
        let replicas = vec![1, 2, 3, 4];
        let mut retry = RetrySet::new(3);
        retry.mark_tried(Token(5), 2);

        // Local node is 3, source 2 failed: node 1 is first untried.
        let plan = retry.plan(TokenGroup(0), 2, &failure(5, 2), |_| replicas.as_slice(), 3);
        assert_eq!(
            plan,
            RetryPlan::Retry([(1, [Token(5)].into_iter().collect())].into_iter().collect())
        );
        assert!(retry.contains(TokenGroup(0)));

        // Node 1 fails too: 4 is next, skipping local 3.
        let plan = retry.plan(TokenGroup(0), 1, &failure(5, 1), |_| replicas.as_slice(), 3);
        assert_eq!(
            plan,
            RetryPlan::Retry([(4, [Token(5)].into_iter().collect())].into_iter().collect())
        );
        assert_eq!(retry.attempts(Token(5)), 2);

        // Every replica tried.
        let plan = retry.plan(TokenGroup(0), 4, &failure(5, 4), |_| replicas.as_slice(), 3);
        assert_eq!(
            plan,
            RetryPlan::Exhausted(Error::RetriesExhausted {
                group: TokenGroup(0),
                token: Token(5)
            })
        );
    }

    #[test]
    fn test_attempt_limit() {
        let replicas: Vec<NodeId> = (1..=10).collect();
        let mut retry = RetrySet::new(1);
        assert!(matches!(
            retry.plan(TokenGroup(0), 1, &failure(2, 1), |_| replicas.as_slice(), 99),
            RetryPlan::Retry(_)
        ));
        assert!(matches!(
            retry.plan(TokenGroup(0), 2, &failure(2, 2), |_| replicas.as_slice(), 99),
            RetryPlan::Exhausted(Error::RetriesExhausted { .. })
        ));
    }

    #[test]
    fn test_non_retryable_error_exhausts_immediately() {
        let replicas = vec![1, 2];
        let mut retry = RetrySet::new(3);
        let failed = [(Token(0), Error::Storage("disk full".to_string()))]
            .into_iter()
            .collect();
        assert_eq!(
            retry.plan(TokenGroup(0), 1, &failed, |_| replicas.as_slice(), 9),
            RetryPlan::Exhausted(Error::Storage("disk full".to_string()))
        );
    }

    #[test]
    fn test_clear_group() {
        let replicas = vec![1, 2];
        let mut retry = RetrySet::new(3);
        retry.plan(TokenGroup(1), 1, &failure(17, 1), |_| replicas.as_slice(), 9);
        assert_eq!(retry.attempts(Token(17)), 1);

        retry.clear_group(TokenGroup(1), 4);
        assert_eq!(retry.attempts(Token(17)), 0);
        assert!(retry.groups().is_empty());
        assert_eq!(retry.next_source(Token(17), &replicas, 9), Some(1));
    }
}
