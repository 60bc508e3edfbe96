use crate::{
    action::{Action, ActionType, QueryPlan},
    answer::Answerer,
    cache::ResultCache,
    config::AgentConfig,
    context::{SearchHistoryEntry, SearchResult, SystemContext},
    errors::{AgentError, AgentResult},
    evaluate::Evaluator,
    events::{SearchStatus, Source, StepStatus, StreamEvent},
    guardrail::{Guardrail, GuardrailDecision},
    kv::KvStore,
    opentelemetry::{trace_stage, RunSpan},
    rate_limit::{RateLimitDecision, RateLimiter, RequestUser},
    rewrite::QueryRewriter,
    scrape::Scraper,
    search::{favicon_url, SearchProvider},
    stream::EventWriter,
    summarize::{SummarizeRequest, Summarizer},
};
use deepsearch_llm::LanguageModel;
use futures::future::{join_all, BoxFuture};
use std::{collections::HashSet, sync::Arc};
use tracing::warn;
use tracing_futures::Instrument;

/// Sink invoked with the assembled assistant text once the answer stream
/// completes. Persistence failures are the sink's concern; the user already
/// received the answer.
pub type OnFinish = Box<dyn FnOnce(String) -> BoxFuture<'static, ()> + Send>;

pub struct RunSessionParams {
    pub config: AgentConfig,
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn SearchProvider>,
    pub scraper: Arc<dyn Scraper>,
    pub kv: Arc<dyn KvStore>,
}

/// Drives one request through the agent loop:
/// admit, guard, then plan / fan out / evaluate until the evaluator answers
/// or the step budget runs out, finally streaming the answer.
pub struct RunSession {
    config: AgentConfig,
    limiter: RateLimiter,
    guardrail: Guardrail,
    rewriter: QueryRewriter,
    summarizer: Summarizer,
    evaluator: Evaluator,
    answerer: Answerer,
    search: Arc<dyn SearchProvider>,
    scraper: Arc<dyn Scraper>,
}

impl RunSession {
    #[must_use]
    pub fn new(params: RunSessionParams) -> Self {
        let RunSessionParams {
            config,
            model,
            search,
            scraper,
            kv,
        } = params;

        let cache = ResultCache::new(kv.clone(), config.cache_ttl);
        let limiter = RateLimiter::new(kv, &config);

        Self {
            limiter,
            guardrail: Guardrail::new(model.clone()),
            rewriter: QueryRewriter::new(model.clone()),
            summarizer: Summarizer::new(model.clone(), cache),
            evaluator: Evaluator::new(model.clone()),
            answerer: Answerer::new(model),
            search,
            scraper,
            config,
        }
    }

    /// Admission gate, run before any event is emitted. A deny carries the
    /// decision for the HTTP layer's 429 headers and leaves all counters
    /// unchanged.
    pub async fn admit(&self, user: &RequestUser) -> AgentResult<RateLimitDecision> {
        let decision = self.limiter.check_request(user).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(AgentError::Admission(decision))
        }
    }

    /// Run the loop to completion, pushing events through `writer`. Always
    /// returns; failures end the stream with an `error` event. The whole run
    /// is bounded by the configured request timeout.
    pub async fn run(
        &self,
        mut ctx: SystemContext,
        writer: EventWriter,
        on_finish: Option<OnFinish>,
    ) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let run_span = RunSpan::new(&request_id);
        let span = run_span.span();

        let outcome = tokio::time::timeout(
            self.config.request_timeout,
            self.drive(&mut ctx, &writer, on_finish, &run_span),
        )
        .instrument(span)
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(AgentError::Cancelled)) => {
                // The client is gone; there is nobody left to notify.
                run_span.on_error(&AgentError::Cancelled);
            }
            Ok(Err(error)) => {
                run_span.on_error(&error);
                let _ = writer
                    .send(StreamEvent::Error {
                        message: error.client_message().to_string(),
                    })
                    .await;
            }
            Err(_elapsed) => {
                run_span.on_error(&AgentError::Cancelled);
                let _ = writer
                    .send(StreamEvent::Error {
                        message: "cancelled".to_string(),
                    })
                    .await;
            }
        }
    }

    async fn drive(
        &self,
        ctx: &mut SystemContext,
        writer: &EventWriter,
        mut on_finish: Option<OnFinish>,
        run_span: &RunSpan,
    ) -> AgentResult<()> {
        // GUARD
        if let GuardrailDecision::Refuse { reason } = self.guardrail.classify(ctx).await {
            let text = self.answerer.stream_refusal(ctx, &reason, writer).await?;
            finish(on_finish.take(), text).await;
            return Ok(());
        }

        // LOOP
        while ctx.current_step() < self.config.max_steps {
            let step = ctx.current_step();
            run_span.on_step(step);

            // PLAN
            writer
                .send(StreamEvent::Planning {
                    title: format!("Research pass {}", step + 1),
                    reasoning: "Reviewing the conversation and gathered evidence to decide \
the next searches."
                        .to_string(),
                })
                .await?;

            let plan = match self.plan_queries(ctx, step).await {
                Ok(plan) => plan,
                Err(error) => return self.bail_out(ctx, writer, on_finish.take(), error).await,
            };

            writer
                .send(StreamEvent::QueriesGenerated {
                    plan: plan.plan.clone(),
                    queries: plan.queries.clone(),
                })
                .await?;

            // FANOUT
            let prior_urls: HashSet<String> = ctx
                .recorded_urls()
                .into_iter()
                .map(str::to_string)
                .collect();
            let conversation = ctx.message_history_text();

            let settled = self
                .fan_out(&plan.queries, &prior_urls, &conversation, writer)
                .await;

            // Barrier passed: record entries in input order, dropping any URL
            // already recorded earlier in this loop.
            let mut seen = prior_urls;
            let mut sources = Vec::new();
            for entry in settled.into_iter().flatten() {
                let mut kept = Vec::new();
                for result in entry.results {
                    if seen.insert(result.url.clone()) {
                        sources.push(Source {
                            title: result.title.clone(),
                            url: result.url.clone(),
                            snippet: result.snippet.clone(),
                            favicon: favicon_url(&result.url),
                        });
                        kept.push(result);
                    }
                }
                ctx.record_search(SearchHistoryEntry {
                    query: entry.query,
                    results: kept,
                });
            }

            writer
                .send(StreamEvent::SourcesFound {
                    step_index: step,
                    sources,
                })
                .await?;

            // EVAL
            let action = match self.evaluate_step(ctx, step).await {
                Ok(action) => action,
                Err(error) => return self.bail_out(ctx, writer, on_finish.take(), error).await,
            };

            ctx.record_feedback(action.feedback().to_string());
            let action_type = action.action_type();
            let feedback = action.feedback().to_string();

            writer.send(StreamEvent::NewAction { action }).await?;
            writer
                .send(StreamEvent::EvaluatorFeedback {
                    feedback,
                    action_type,
                })
                .await?;

            match action_type {
                ActionType::Answer => {
                    let text = trace_stage("answer", step, {
                        self.answerer.stream_answer(ctx, false, writer)
                    })
                    .await?;
                    finish(on_finish.take(), text).await;
                    return Ok(());
                }
                ActionType::Continue => {
                    writer
                        .send(StreamEvent::ActionUpdate {
                            step_index: step,
                            status: StepStatus::Completed,
                            error: None,
                        })
                        .await?;
                    ctx.increment_step();
                }
            }
        }

        // Step budget exhausted without an answer decision.
        let step = ctx.current_step();
        let text = trace_stage("answer", step, {
            self.answerer.stream_answer(ctx, true, writer)
        })
        .await?;
        finish(on_finish.take(), text).await;
        Ok(())
    }

    /// Rewrite with one retry. A schema violation after the retry falls back
    /// to a single query equal to the user's last message; transport errors
    /// bubble up.
    async fn plan_queries(&self, ctx: &SystemContext, step: usize) -> AgentResult<QueryPlan> {
        match trace_stage("rewrite", step, self.rewriter.rewrite(ctx)).await {
            Ok(plan) => Ok(plan),
            Err(first_error) => {
                warn!(%first_error, "rewriter failed, retrying once");
                match trace_stage("rewrite", step, self.rewriter.rewrite(ctx)).await {
                    Ok(plan) => Ok(plan),
                    Err(AgentError::Planner(message)) => {
                        warn!(%message, "rewriter failed twice, falling back to direct query");
                        Ok(QueryPlan {
                            plan: "Search the web for the user's question directly.".to_string(),
                            queries: vec![ctx.last_user_message()],
                        })
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    /// Evaluate with one retry; failures after that bubble up.
    async fn evaluate_step(&self, ctx: &SystemContext, step: usize) -> AgentResult<Action> {
        match trace_stage("evaluate", step, self.evaluator.evaluate(ctx)).await {
            Ok(action) => Ok(action),
            Err(first_error) => {
                warn!(%first_error, "evaluator failed, retrying once");
                trace_stage("evaluate", step, self.evaluator.evaluate(ctx)).await
            }
        }
    }

    /// Run all queries of one step concurrently, each through its own
    /// search / scrape / summarize pipeline. Individual failures yield `None`
    /// and never abort the fan-out. `join_all` is the step barrier and
    /// preserves input order.
    async fn fan_out(
        &self,
        queries: &[String],
        prior_urls: &HashSet<String>,
        conversation: &str,
        writer: &EventWriter,
    ) -> Vec<Option<SearchHistoryEntry>> {
        let tasks = queries.iter().enumerate().map(|(index, query)| {
            let writer = writer.clone();
            async move {
                if writer
                    .send(StreamEvent::SearchUpdate {
                        query_index: index,
                        query: query.clone(),
                        status: SearchStatus::Loading,
                        error: None,
                    })
                    .await
                    .is_err()
                {
                    return None;
                }

                match self.run_query(query, prior_urls, conversation).await {
                    Ok(entry) => {
                        let _ = writer
                            .send(StreamEvent::SearchUpdate {
                                query_index: index,
                                query: query.clone(),
                                status: SearchStatus::Completed,
                                error: None,
                            })
                            .await;
                        Some(entry)
                    }
                    Err(error) => {
                        warn!(%query, %error, "query failed during fan-out");
                        let _ = writer
                            .send(StreamEvent::SearchUpdate {
                                query_index: index,
                                query: query.clone(),
                                status: SearchStatus::Error,
                                error: Some(error.client_message().to_string()),
                            })
                            .await;
                        None
                    }
                }
            }
        });

        join_all(tasks).await
    }

    /// One query's pipeline: search, then scrape and summarize the top hits
    /// in parallel. URLs already scraped earlier in this loop are skipped.
    async fn run_query(
        &self,
        query: &str,
        prior_urls: &HashSet<String>,
        conversation: &str,
    ) -> AgentResult<SearchHistoryEntry> {
        let hits = self
            .search
            .search(query, self.config.search_results_count)
            .await?;

        let mut unique = HashSet::new();
        let hits: Vec<_> = hits
            .into_iter()
            .filter(|hit| !prior_urls.contains(&hit.url) && unique.insert(hit.url.clone()))
            .take(self.config.search_results_count)
            .collect();

        let results = join_all(hits.into_iter().map(|hit| async move {
            let outcome = self.scraper.scrape_page(&hit.url).await;
            let scraped_content = if outcome.success {
                outcome.data.unwrap_or_default()
            } else {
                String::new()
            };

            let summary = self
                .summarizer
                .summarize(&SummarizeRequest {
                    query: query.to_string(),
                    url: hit.url.clone(),
                    title: hit.title.clone(),
                    snippet: hit.snippet.clone(),
                    scraped_content: scraped_content.clone(),
                    conversation: conversation.to_string(),
                })
                .await;

            SearchResult {
                date: hit.date,
                title: hit.title,
                url: hit.url,
                snippet: hit.snippet,
                scraped_content,
                summary,
            }
        }))
        .await;

        Ok(SearchHistoryEntry {
            query: query.to_string(),
            results,
        })
    }

    /// Planner-level failure: emit a terminal `error` event, then attempt a
    /// last-ditch final answer from whatever history exists.
    async fn bail_out(
        &self,
        ctx: &SystemContext,
        writer: &EventWriter,
        on_finish: Option<OnFinish>,
        error: AgentError,
    ) -> AgentResult<()> {
        if matches!(error, AgentError::Cancelled) {
            return Err(error);
        }

        writer
            .send(StreamEvent::Error {
                message: error.client_message().to_string(),
            })
            .await?;

        match self.answerer.stream_answer(ctx, true, writer).await {
            Ok(text) => finish(on_finish, text).await,
            Err(answer_error) => {
                warn!(%answer_error, "best-effort final answer failed");
            }
        }
        Ok(())
    }
}

async fn finish(on_finish: Option<OnFinish>, text: String) {
    if let Some(callback) = on_finish {
        callback(text).await;
    }
}
