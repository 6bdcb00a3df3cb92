//! Conversation statistics collection and global stat aggregation.
//!
//! Everything here is best-effort per item: a failed count degrades to 0 and
//! a failed lookup falls back to the raw identifier. The one exception is an
//! invalid credential, which aborts the whole collection so the worker can
//! discard the job.

use crate::config::Config;
use crate::slack_api::{SlackApi, SlackApiError};
use futures_util::future::join_all;
use std::time::Duration;
use wrapped_types::{JobMode, TopChannel, TopDm};

#[derive(Debug)]
pub struct ConversationStats {
    pub top_channels: Vec<TopChannel>,
    pub top_dms: Vec<TopDm>,
}

pub struct GlobalStats {
    pub total_messages: u64,
    pub confessions_messages: u64,
    pub meta_messages: u64,
    pub prox_messages: u64,
}

enum Target {
    Channel(String),
    Dm(String),
}

/// Enumerate the user's conversations and count their messages in each one,
/// in small concurrent batches, then rank the results.
pub async fn collect_conversation_stats(
    api: &SlackApi,
    cfg: &Config,
    platform_user_id: &str,
    user_token: &str,
    mode: JobMode,
) -> Result<ConversationStats, SlackApiError> {
    let types = match mode {
        JobMode::Restricted => "public_channel",
        JobMode::Default => "public_channel,private_channel,im",
    };

    let conversations = match api.list_conversations(user_token, types).await {
        Ok(c) => c,
        Err(e) if e.is_credential_fatal() => return Err(e),
        Err(e) => {
            log::error!(
                "[SCRAPER] Conversation listing failed for {}: {}",
                platform_user_id,
                e
            );
            Vec::new()
        }
    };
    log::info!(
        "[SCRAPER] {} is in {} conversations",
        platform_user_id,
        conversations.len()
    );

    // Bot tokens carry the public-channel queries round-robin; the user's
    // own token is reserved for content a bot cannot see.
    let public_tokens: Vec<String> = api
        .pool()
        .tokens()
        .iter()
        .cloned()
        .chain(std::iter::once(user_token.to_string()))
        .filter(|t| !t.is_empty())
        .collect();
    let mut public_token_idx = 0usize;

    let mut channel_counts: Vec<(String, u64)> = Vec::new();
    let mut dm_counts: Vec<(String, u64)> = Vec::new();

    for batch in conversations.chunks(cfg.batch_size.max(1)) {
        let mut queries: Vec<(Target, String, String)> = Vec::new();

        for convo in batch {
            if convo.is_im {
                // A DM without an identifiable partner has nothing to rank
                let Some(partner) = convo.user.clone() else {
                    continue;
                };
                let query = format!(
                    "from:<@{platform_user_id}> to:<@{partner}> during:{}",
                    cfg.wrapped_year
                );
                queries.push((Target::Dm(partner), user_token.to_string(), query));
            } else if convo.is_private || convo.is_mpim {
                let query = format!(
                    "from:<@{platform_user_id}> in:{} during:{}",
                    convo.name, cfg.wrapped_year
                );
                queries.push((Target::Channel(convo.name.clone()), user_token.to_string(), query));
            } else {
                let token = public_tokens
                    .get(public_token_idx % public_tokens.len().max(1))
                    .cloned()
                    .unwrap_or_else(|| user_token.to_string());
                public_token_idx += 1;
                let query = format!(
                    "from:<@{platform_user_id}> in:{} during:{}",
                    convo.name, cfg.wrapped_year
                );
                queries.push((Target::Channel(convo.name.clone()), token, query));
            }
        }

        let results = join_all(
            queries
                .iter()
                .map(|(_, token, query)| api.search_count(token, query)),
        )
        .await;

        for ((target, _, _), result) in queries.iter().zip(results) {
            let count = match result {
                Ok(n) => n,
                Err(e) if e.is_credential_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("[SCRAPER] Count query failed, treating as 0: {}", e);
                    0
                }
            };
            match target {
                Target::Channel(name) => channel_counts.push((name.clone(), count)),
                Target::Dm(partner) => dm_counts.push((partner.clone(), count)),
            }
        }

        tokio::time::sleep(Duration::from_millis(cfg.batch_delay_ms)).await;
    }

    // Top 5 channels with dense ranks
    channel_counts.sort_by(|a, b| b.1.cmp(&a.1));
    let top_channels = channel_counts
        .iter()
        .take(5)
        .enumerate()
        .map(|(i, (name, _))| TopChannel {
            name: name.clone(),
            rank: i as u32 + 1,
        })
        .collect();

    // Top 5 DM partners, never the user themselves
    dm_counts.retain(|(partner, _)| partner != platform_user_id);
    dm_counts.sort_by(|a, b| b.1.cmp(&a.1));
    dm_counts.truncate(5);

    let lookups = join_all(
        dm_counts
            .iter()
            .map(|(partner, _)| api.user_info(user_token, partner)),
    )
    .await;

    let mut top_dms = Vec::new();
    for ((partner, count), lookup) in dm_counts.iter().zip(lookups) {
        let dm = match lookup {
            Ok(Some(info)) => TopDm {
                name: info.display_name().to_string(),
                count: *count,
                image: info.avatar(),
            },
            Ok(None) => TopDm {
                name: partner.clone(),
                count: *count,
                image: None,
            },
            Err(e) if e.is_credential_fatal() => return Err(e),
            Err(e) => {
                log::warn!("[SCRAPER] User lookup failed for {}: {}", partner, e);
                TopDm {
                    name: partner.clone(),
                    count: *count,
                    image: None,
                }
            }
        };
        top_dms.push(dm);
    }

    Ok(ConversationStats {
        top_channels,
        top_dms,
    })
}

/// The fixed set of targeted counts: total messages this year, the two
/// named channels, and (default mode only) the special recipient.
pub async fn aggregate_global_stats(
    api: &SlackApi,
    cfg: &Config,
    platform_user_id: &str,
    user_token: &str,
    mode: JobMode,
) -> Result<GlobalStats, SlackApiError> {
    let total_q = format!("from:<@{platform_user_id}> during:{}", cfg.wrapped_year);
    let confessions_q = format!(
        "from:<@{platform_user_id}> in:{} during:{}",
        cfg.confessions_channel, cfg.wrapped_year
    );
    let meta_q = format!(
        "from:<@{platform_user_id}> in:{} during:{}",
        cfg.meta_channel, cfg.wrapped_year
    );
    let prox_q = format!(
        "from:<@{platform_user_id}> to:<@{}> during:{}",
        cfg.prox_user_id, cfg.wrapped_year
    );

    let prox_fut = async {
        if mode == JobMode::Default {
            api.search_count(user_token, &prox_q).await
        } else {
            Ok(0)
        }
    };

    let (total, confessions, meta, prox) = tokio::join!(
        api.search_count(user_token, &total_q),
        api.search_count(user_token, &confessions_q),
        api.search_count(user_token, &meta_q),
        prox_fut,
    );

    Ok(GlobalStats {
        total_messages: degrade("total", total)?,
        confessions_messages: degrade("confessions", confessions)?,
        meta_messages: degrade("meta", meta)?,
        prox_messages: degrade("prox", prox)?,
    })
}

fn degrade(label: &str, result: Result<u64, SlackApiError>) -> Result<u64, SlackApiError> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if e.is_credential_fatal() => Err(e),
        Err(e) => {
            log::warn!("[SCRAPER] {} count failed, treating as 0: {}", label, e);
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack_api::TokenPool;
    use crate::testutil::{self, MockSlack, Reply};

    const USER: &str = "U1";
    const USER_TOKEN: &str = "xoxp-user";

    fn channel_of(query: &str) -> Option<&str> {
        query.split_whitespace().find_map(|w| w.strip_prefix("in:"))
    }

    fn api_with(base_url: &str, bots: Vec<&str>) -> SlackApi {
        SlackApi::new(
            base_url,
            TokenPool::new(bots.into_iter().map(str::to_string).collect()),
            2,
        )
    }

    #[tokio::test]
    async fn ranks_top_channels_descending_with_dense_ranks() {
        let mock = MockSlack::start(|req| match req.endpoint.as_str() {
            "users.conversations" => Reply::ok(testutil::conversations_page(
                (1..=7)
                    .map(|i| testutil::public_channel(&format!("C{i}"), &format!("chan{i}")))
                    .collect(),
                None,
            )),
            "search.messages" => {
                let query = req.params.get("query").map(String::as_str).unwrap_or("");
                // chan1 -> 10, chan2 -> 20, ... chan7 -> 70
                let n: u64 = channel_of(query)
                    .and_then(|c| c.strip_prefix("chan"))
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(0);
                Reply::ok(testutil::search_total(n * 10))
            }
            other => panic!("unexpected endpoint {other}"),
        })
        .await;

        let api = api_with(&mock.base_url, vec!["xoxb-bot"]);
        let cfg = testutil::test_config();
        let stats = collect_conversation_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Default)
            .await
            .unwrap();

        assert_eq!(stats.top_channels.len(), 5);
        assert_eq!(stats.top_channels[0].name, "chan7");
        assert_eq!(stats.top_channels[4].name, "chan3");
        for (i, entry) in stats.top_channels.iter().enumerate() {
            assert_eq!(entry.rank, i as u32 + 1);
        }
    }

    #[tokio::test]
    async fn dm_partners_are_resolved_and_self_is_excluded() {
        let mock = MockSlack::start(|req| match req.endpoint.as_str() {
            "users.conversations" => Reply::ok(testutil::conversations_page(
                vec![
                    testutil::im("D1", "U2"),
                    testutil::im("D2", USER),
                    serde_json::json!({ "id": "D3", "is_im": true }),
                ],
                None,
            )),
            "search.messages" => Reply::ok(testutil::search_total(7)),
            "users.info" => Reply::ok(testutil::user_info_ok(
                "orpheus",
                "Orpheus the Dino",
                Some("https://img.test/orpheus.png"),
            )),
            other => panic!("unexpected endpoint {other}"),
        })
        .await;

        let api = api_with(&mock.base_url, vec![]);
        let cfg = testutil::test_config();
        let stats = collect_conversation_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Default)
            .await
            .unwrap();

        assert_eq!(stats.top_dms.len(), 1);
        assert_eq!(stats.top_dms[0].name, "Orpheus the Dino");
        assert_eq!(stats.top_dms[0].count, 7);
        assert_eq!(
            stats.top_dms[0].image.as_deref(),
            Some("https://img.test/orpheus.png")
        );
    }

    #[tokio::test]
    async fn transient_count_failures_degrade_to_zero() {
        let mock = MockSlack::start(|req| match req.endpoint.as_str() {
            "users.conversations" => Reply::ok(testutil::conversations_page(
                vec![
                    testutil::public_channel("C1", "good"),
                    testutil::public_channel("C2", "flaky"),
                ],
                None,
            )),
            "search.messages" => {
                let query = req.params.get("query").map(String::as_str).unwrap_or("");
                if channel_of(query) == Some("flaky") {
                    Reply::error("internal_error")
                } else {
                    Reply::ok(testutil::search_total(9))
                }
            }
            other => panic!("unexpected endpoint {other}"),
        })
        .await;

        let api = SlackApi::new(&mock.base_url, TokenPool::new(vec![]), 1);
        let cfg = testutil::test_config();
        let stats = collect_conversation_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Default)
            .await
            .unwrap();

        // Both channels present; the flaky one counted as zero
        assert_eq!(stats.top_channels.len(), 2);
        assert_eq!(stats.top_channels[0].name, "good");
        assert_eq!(stats.top_channels[1].name, "flaky");
    }

    #[tokio::test]
    async fn revoked_credential_aborts_collection() {
        let mock = MockSlack::start(|req| match req.endpoint.as_str() {
            "users.conversations" => Reply::ok(testutil::conversations_page(
                vec![testutil::public_channel("C1", "general")],
                None,
            )),
            _ => Reply::error("token_revoked"),
        })
        .await;

        let api = api_with(&mock.base_url, vec![]);
        let cfg = testutil::test_config();
        let err = collect_conversation_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Default)
            .await
            .unwrap_err();
        assert!(err.is_credential_fatal());
    }

    #[tokio::test]
    async fn private_and_dm_queries_use_the_user_token() {
        let mock = MockSlack::start(|req| match req.endpoint.as_str() {
            "users.conversations" => Reply::ok(testutil::conversations_page(
                vec![
                    testutil::public_channel("C1", "lounge"),
                    testutil::private_channel("C2", "secret-club"),
                    testutil::im("D1", "U2"),
                ],
                None,
            )),
            "search.messages" => Reply::ok(testutil::search_total(1)),
            "users.info" => Reply::ok(testutil::user_info_ok("u2", "User Two", None)),
            other => panic!("unexpected endpoint {other}"),
        })
        .await;

        let api = api_with(&mock.base_url, vec!["xoxb-bot"]);
        let cfg = testutil::test_config();
        collect_conversation_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Default)
            .await
            .unwrap();

        for req in mock.requests_for("search.messages") {
            let query = req.params.get("query").cloned().unwrap_or_default();
            if query.contains("in:secret-club") || query.contains("to:<@U2>") {
                assert_eq!(req.token, USER_TOKEN, "query `{query}` must use the user token");
            } else if query.contains("in:lounge") {
                assert_eq!(req.token, "xoxb-bot", "public query should round-robin bot tokens");
            }
        }
    }

    #[tokio::test]
    async fn restricted_mode_requests_only_public_data() {
        let mock = MockSlack::start(|req| match req.endpoint.as_str() {
            "users.conversations" => Reply::ok(testutil::conversations_page(
                vec![testutil::public_channel("C1", "lounge")],
                None,
            )),
            "search.messages" => Reply::ok(testutil::search_total(3)),
            other => panic!("unexpected endpoint {other}"),
        })
        .await;

        let api = api_with(&mock.base_url, vec![]);
        let cfg = testutil::test_config();

        collect_conversation_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Restricted)
            .await
            .unwrap();
        let global = aggregate_global_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Restricted)
            .await
            .unwrap();
        assert_eq!(global.prox_messages, 0);

        for req in mock.requests_for("users.conversations") {
            assert_eq!(req.params.get("types").map(String::as_str), Some("public_channel"));
        }
        for req in mock.requests_for("search.messages") {
            let query = req.params.get("query").cloned().unwrap_or_default();
            assert!(
                !query.contains(&format!("to:<@{}>", cfg.prox_user_id)),
                "restricted mode must not issue the special-recipient query"
            );
        }
    }

    #[tokio::test]
    async fn aggregate_counts_are_independent_best_effort() {
        let mock = MockSlack::start(|req| {
            let query = req.params.get("query").map(String::as_str).unwrap_or("");
            if channel_of(query) == Some("confessions") {
                Reply::error("internal_error")
            } else if query.contains("to:<@UPROX>") {
                Reply::ok(testutil::search_total(4))
            } else if channel_of(query) == Some("meta") {
                Reply::ok(testutil::search_total(15))
            } else {
                Reply::ok(testutil::search_total(100))
            }
        })
        .await;

        let api = SlackApi::new(&mock.base_url, TokenPool::new(vec![]), 1);
        let cfg = testutil::test_config();
        let global = aggregate_global_stats(&api, &cfg, USER, USER_TOKEN, JobMode::Default)
            .await
            .unwrap();

        assert_eq!(global.total_messages, 100);
        assert_eq!(global.confessions_messages, 0);
        assert_eq!(global.meta_messages, 15);
        assert_eq!(global.prox_messages, 4);
    }
}
