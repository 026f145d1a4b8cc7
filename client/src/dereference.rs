use widgetsync_shared::{ModelId, StateMap};

use crate::model::registry::ModelRegistry;
use crate::model::ModelHandle;

/// Resolves every reference placeholder in a state delta against the live
/// model pool, without suspending. Returns `None` if any single reference
/// names a model that is not resolvable yet: the caller drops the entire
/// update and a later event naming the missing model retries it.
///
/// Partial application would be worse than temporary staleness: rendering
/// code cannot safely special-case a half-resolved object.
pub fn dereference_links(
    state: &StateMap<ModelId>,
    registry: &ModelRegistry,
) -> Option<StateMap<ModelHandle>> {
    let mut resolved = StateMap::with_capacity(state.len());
    for (key, value) in state {
        let value = value.resolve(&mut |model_id: &ModelId| {
            registry.try_get(model_id).map(|model| model.handle())
        })?;
        resolved.insert(key.clone(), value);
    }
    Some(resolved)
}
