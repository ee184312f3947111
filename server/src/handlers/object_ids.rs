use crate::client::Client;
use crate::game_server::GameServer;
use shared::{encode_object_ids, MSG_OBJECT_IDS, OBJECT_ID_BATCH, OBJECT_ID_BATCH_BIG};
use std::sync::Arc;

/// `msgRequestObjectIds`: reserves a batch of ids for the client. Big mode
/// hands out smaller batches since far more clients share the pool.
pub fn handle_request_object_ids(server: &Arc<GameServer>, client: &Arc<Client>, _body: &[u8]) {
    let server_ref = Arc::clone(server);
    let client = Arc::clone(client);

    server.main_context().submit(move || {
        if !client.is_live() {
            return;
        }

        let count = if server_ref.config().big_mode {
            OBJECT_ID_BATCH_BIG
        } else {
            OBJECT_ID_BATCH
        };

        let ids = server_ref
            .collaborators()
            .object_ids
            .allocate(&client, count);
        server_ref.send_to_client(&client, MSG_OBJECT_IDS, &encode_object_ids(&ids), true);
    });
}
