//! Projecting queued mutations onto a list of entities.

use std::collections::HashMap;

use crate::model::{is_local_id, CachedEntity, MutationPayload, OperationKind, PendingOperation};

/// Reference stored on optimistic entities whose image is still in the outbox.
pub fn outbox_image_ref(op_id: i64) -> String {
  format!("outbox:{}", op_id)
}

/// The optimistic copy of an entry created offline.
pub fn optimistic_entity(op: &PendingOperation) -> Option<CachedEntity> {
  match &op.payload {
    MutationPayload::Create {
      local_id,
      fields,
      attachment,
    } => Some(CachedEntity {
      id: local_id.clone(),
      text_content: fields.text_entry.clone(),
      created_at: fields.created_at.clone(),
      public: fields.public_status,
      remote_image_url: None,
      local_image_ref: attachment.as_ref().map(|_| outbox_image_ref(op.id)),
      pending: Some(OperationKind::Create),
      server_public: None,
    }),
    _ => None,
  }
}

/// Apply every queued operation to `entities`, in enqueue order.
///
/// `remaps` maps local ids to the server ids their creates became. Pending
/// creates add optimistic copies; deletes and visibility changes mark the
/// entity they target.
pub fn overlay_pending(
  mut entities: Vec<CachedEntity>,
  ops: &[PendingOperation],
  remaps: &HashMap<String, String>,
) -> Vec<CachedEntity> {
  for op in ops {
    if let Some(optimistic) = optimistic_entity(op) {
      if !entities.iter().any(|e| e.id == optimistic.id) {
        entities.push(optimistic);
      }
      continue;
    }

    let target = op.target_id();
    let resolved = remaps.get(target).map(String::as_str).unwrap_or(target);
    let Some(entity) = entities
      .iter_mut()
      .find(|e| e.id == resolved || e.id == target)
    else {
      continue;
    };

    match &op.payload {
      MutationPayload::Delete { .. } => entity.pending = Some(OperationKind::Delete),
      MutationPayload::SetVisibility { public, .. } => {
        entity.server_public.get_or_insert(entity.public);
        entity.public = *public;
        if entity.pending.is_none() {
          entity.pending = Some(OperationKind::SetVisibility);
        }
      }
      MutationPayload::Create { .. } => {}
    }
  }
  entities
}

/// Strip every marker a previous overlay added: optimistic copies go,
/// pending flags clear and overridden visibility reverts.
pub fn strip_pending(entities: Vec<CachedEntity>) -> Vec<CachedEntity> {
  entities
    .into_iter()
    .filter(|e| !(is_local_id(&e.id) && e.pending == Some(OperationKind::Create)))
    .map(|mut e| {
      e.pending = None;
      if let Some(public) = e.server_public.take() {
        e.public = public;
      }
      e
    })
    .collect()
}
