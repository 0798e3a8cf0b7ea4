use crate::model::{CompositeQuery, GroupByKey};

/// `defaults ++ custom`. Defaults keep their declared order and a custom key
/// equal to a default is kept as well.
pub fn compose_group_by(defaults: &[GroupByKey], custom: &[GroupByKey]) -> Vec<GroupByKey> {
    defaults.iter().chain(custom).cloned().collect()
}

/// Applies the same composed grouping to every builder query and trace
/// operator of one chart.
pub fn apply_group_by(
    composite: &CompositeQuery,
    defaults: &[GroupByKey],
    custom: &[GroupByKey],
) -> CompositeQuery {
    let group_by = compose_group_by(defaults, custom);
    let mut next = composite.clone();
    for query in next
        .builder
        .query_data
        .iter_mut()
        .chain(next.builder.query_trace_operator.iter_mut())
    {
        query.group_by = group_by.clone();
    }
    next
}
