use crate::{ModelResponse, ModelUsage, PartialModelResponse};

/// Accumulates partial responses from a model stream into a full response.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    usage: Option<ModelUsage>,
}

impl StreamAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_partial(&mut self, partial: &PartialModelResponse) {
        if let Some(delta) = &partial.delta {
            self.text.push_str(delta);
        }
        if let Some(usage) = &partial.usage {
            self.usage.get_or_insert_with(ModelUsage::default).add(usage);
        }
    }

    /// Total text accumulated so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn compute_response(self) -> ModelResponse {
        ModelResponse {
            text: self.text,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_deltas_in_order() {
        let mut acc = StreamAccumulator::new();
        acc.add_partial(&PartialModelResponse::delta("Hello"));
        acc.add_partial(&PartialModelResponse::delta(", world"));
        acc.add_partial(&PartialModelResponse {
            delta: None,
            usage: Some(ModelUsage {
                input_tokens: 3,
                output_tokens: 5,
            }),
        });

        let response = acc.compute_response();
        assert_eq!(response.text, "Hello, world");
        assert_eq!(
            response.usage,
            Some(ModelUsage {
                input_tokens: 3,
                output_tokens: 5
            })
        );
    }
}
