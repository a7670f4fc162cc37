mod common;

use std::sync::Arc;

use common::{init_tracing, ScriptedBackend, MODEL_ID};
use llmport::types::{ChatHistoryData, ModelSpecifier};
use llmport::{
    create_llm_backend_interface, llm_backend_server, BackendClient, FramedTransport, PortConfig,
    PortError, PredictCreationParameter,
};

#[cfg(test)]
mod framed_tests {
    use super::*;

    #[tokio::test]
    async fn prediction_over_a_byte_stream() {
        init_tracing();
        let config = PortConfig::new();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = llm_backend_server(Arc::new(ScriptedBackend::hello()), config.clone())
            .await
            .unwrap();
        let server_task = tokio::spawn(async move {
            server
                .serve(FramedTransport::new(server_io, config.max_frame_length()))
                .await
        });

        let client = BackendClient::connect(
            FramedTransport::new(client_io, PortConfig::new().max_frame_length()),
            create_llm_backend_interface().unwrap(),
            PortConfig::new(),
        );
        let parameter = PredictCreationParameter::new(
            ModelSpecifier::identifier(MODEL_ID),
            ChatHistoryData::from_user_messages(["Hello"]),
        );
        let result = client
            .predict(&parameter)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap()
            .into_prediction_result()
            .unwrap();
        assert_eq!(result.content, "Hi there");
        assert_eq!(client.count_tokens(ModelSpecifier::identifier(MODEL_ID), "four").await.unwrap(), 4);

        drop(client);
        assert!(server_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn oversized_frames_end_the_connection() {
        init_tracing();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = llm_backend_server(Arc::new(ScriptedBackend::hello()), PortConfig::new())
            .await
            .unwrap();
        let server_task =
            tokio::spawn(async move { server.serve(FramedTransport::new(server_io, 64)).await });

        let client = BackendClient::connect(
            FramedTransport::new(client_io, 1024 * 1024),
            create_llm_backend_interface().unwrap(),
            PortConfig::new(),
        );
        let err = client
            .tokenize(ModelSpecifier::identifier(MODEL_ID), "x".repeat(1024))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::ConnectionClosed));
        assert!(matches!(server_task.await.unwrap(), Err(PortError::IoError(_))));
    }
}
