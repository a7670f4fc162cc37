mod common;

use std::sync::Arc;

use common::{connect, ScriptedBackend};
use llmport::types::{ChatHistoryData, LlmTool};
use llmport::{
    GenerateToClientPacket, GeneratorCreationParameter, KvConfig, KvConfigStack, PortConfig,
    PortError, SessionOutcome, WireErrorKind,
};

#[cfg(test)]
mod generator_tests {
    use super::*;

    #[tokio::test]
    async fn echo_generator_streams_the_last_user_message() {
        let (client, _server) = connect(Arc::new(ScriptedBackend::hello()), PortConfig::new()).await;

        let parameter = GeneratorCreationParameter::new(
            "echo",
            ChatHistoryData::from_user_messages(["ignored", "hello brave world"]),
        )
        .with_tools(vec![LlmTool::function("get_weather", "Current weather for a city")])
        .with_working_directory("/tmp/plugins");

        let mut channel = client.generate_with_generator(&parameter).await.unwrap();
        let mut fragments = 0;
        let mut terminal = None;
        while let Some(packet) = channel.next().await {
            match packet.unwrap() {
                GenerateToClientPacket::Fragment { .. } => fragments += 1,
                other => terminal = Some(other),
            }
        }
        assert_eq!(fragments, 3);
        assert_eq!(terminal, Some(GenerateToClientPacket::Success));
        assert_eq!(channel.session().text(), "hello brave world");
        assert_eq!(channel.outcome(), Some(SessionOutcome::Success));
    }

    #[tokio::test]
    async fn collect_keeps_the_unit_success() {
        let (client, _server) = connect(Arc::new(ScriptedBackend::hello()), PortConfig::new()).await;

        let parameter = GeneratorCreationParameter::new(
            "echo",
            ChatHistoryData::from_user_messages(["ping"]),
        );
        let outcome = client
            .generate_with_generator(&parameter)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(outcome.content, "ping");
        assert_eq!(outcome.terminal, Some(GenerateToClientPacket::Success));
    }

    #[tokio::test]
    async fn unknown_plugin_is_refused() {
        let (client, _server) = connect(Arc::new(ScriptedBackend::hello()), PortConfig::new()).await;

        let parameter = GeneratorCreationParameter::new("missing", ChatHistoryData::new());
        let mut channel = client.generate_with_generator(&parameter).await.unwrap();
        match channel.next().await {
            Some(Err(PortError::Remote(error))) => {
                assert_eq!(error.kind, WireErrorKind::Backend);
                assert_eq!(error.endpoint, "generateWithGenerator");
                assert!(error.message.contains("missing"));
            }
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_plugin_config_is_refused() {
        let (client, _server) = connect(Arc::new(ScriptedBackend::hello()), PortConfig::new()).await;

        let mut parameter = GeneratorCreationParameter::new("echo", ChatHistoryData::new());
        parameter.plugin_config_stack =
            KvConfigStack::new().with_layer("plugin", KvConfig::new().with("", true));

        let mut channel = client.generate_with_generator(&parameter).await.unwrap();
        match channel.next().await {
            Some(Err(PortError::Remote(error))) => {
                assert_eq!(error.kind, WireErrorKind::Validation);
                assert_eq!(
                    error.path.as_deref(),
                    Some("pluginConfigStack.layers[0].config.fields")
                );
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
