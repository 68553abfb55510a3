//! Server-side Lua scripts
//!
//! Every multi-key queue operation is one script so the whole transition is
//! atomic. Scripts that reassign partitions share the `rebalance` body:
//! list active owners sorted by id, delete every `queue_list:*`, distribute
//! partitions round-robin, rewrite the lists.
//!
//! Randomized eviction is decided client-side (a probability roll chooses
//! the cutoff argument) so the scripts stay deterministic.

/// Shared rebalance function; prepended to the scripts that need it.
const REBALANCE_FN: &str = r#"
local function rebalance(owner_zset, queue_list_prefix, owner_expire, partition_count)
    local owners = redis.call('ZRANGE', owner_zset, 0, -1)
    table.sort(owners)
    local existing = redis.call('KEYS', queue_list_prefix .. '*')
    for i = 1, #existing do
        redis.call('DEL', existing[i])
    end
    local owner_count = #owners
    if owner_count == 0 then
        return {0, {}}
    end
    local assignments = {}
    for i = 1, owner_count do
        assignments[i] = {}
    end
    for p = 1, partition_count do
        local idx = ((p - 1) % owner_count) + 1
        table.insert(assignments[idx], string.format('%03d', p))
    end
    local flat = {}
    for i = 1, owner_count do
        local key = queue_list_prefix .. owners[i]
        for _, partition in ipairs(assignments[i]) do
            redis.call('RPUSH', key, partition)
        end
        redis.call('EXPIRE', key, owner_expire)
        table.insert(flat, owners[i])
        table.insert(flat, assignments[i])
    end
    return {owner_count, flat}
end
"#;

/// KEYS: queue_key, counter. ARGV: member, score, expire_seconds, max_total,
/// evict_before (0 = no eviction tick this call).
/// Returns `{accepted, total_count, message}`.
pub const ENQUEUE: &str = r#"
local queue_key = KEYS[1]
local counter_key = KEYS[2]
local member = ARGV[1]
local score = tonumber(ARGV[2])
local expire_seconds = tonumber(ARGV[3])
local max_total = tonumber(ARGV[4])
local evict_before = tonumber(ARGV[5])

local total = tonumber(redis.call('GET', counter_key) or '0')
if total >= max_total then
    return {0, total, 'queue_full'}
end
local added = redis.call('ZADD', queue_key, score, member)
redis.call('EXPIRE', queue_key, expire_seconds)
if evict_before > 0 then
    local removed = redis.call('ZREMRANGEBYSCORE', queue_key, '-inf', '(' .. evict_before)
    if removed > 0 then
        redis.call('DECRBY', counter_key, removed)
    end
end
local new_total = total
if added == 1 then
    new_total = redis.call('INCR', counter_key)
end
return {1, new_total, 'ok'}
"#;

/// KEYS: owner_zset, queue_list_prefix, queue_prefix, counter.
/// ARGV: owner_id, score_threshold, current_score.
/// Returns `{status, messages}` where status is OK / JOIN_REQUIRED /
/// NO_QUEUES; at most one message per owned partition, oldest first, and
/// only messages old enough (`score <= current_score - score_threshold`).
pub const GET_MESSAGES: &str = r#"
local owner_zset = KEYS[1]
local queue_list_prefix = KEYS[2]
local queue_prefix = KEYS[3]
local counter_key = KEYS[4]
local owner_id = ARGV[1]
local score_threshold = tonumber(ARGV[2])
local current_score = tonumber(ARGV[3])

local queue_list_key = queue_list_prefix .. owner_id
if redis.call('EXISTS', queue_list_key) == 0 then
    return {'JOIN_REQUIRED', {}}
end
local partitions = redis.call('LRANGE', queue_list_key, 0, -1)
if #partitions == 0 then
    return {'NO_QUEUES', {}}
end
local cutoff = current_score - score_threshold
local messages = {}
for _, partition in ipairs(partitions) do
    local queue_key = queue_prefix .. partition
    local head = redis.call('ZRANGE', queue_key, 0, 0, 'WITHSCORES')
    if #head == 2 and tonumber(head[2]) <= cutoff then
        redis.call('ZREM', queue_key, head[1])
        redis.call('DECR', counter_key)
        table.insert(messages, head[1])
    end
end
return {'OK', messages}
"#;

/// KEYS: owner_zset, queue_list_prefix.
/// ARGV: owner_id, now_ms, owner_expire_seconds, partition_count.
/// Registers the owner, prunes stale owners, rebalances.
pub fn join() -> String {
    [
        REBALANCE_FN,
        r#"
local owner_zset = KEYS[1]
local queue_list_prefix = KEYS[2]
local owner_id = ARGV[1]
local now_ms = tonumber(ARGV[2])
local owner_expire = tonumber(ARGV[3])
local partition_count = tonumber(ARGV[4])

redis.call('ZADD', owner_zset, now_ms, owner_id)
redis.call('ZREMRANGEBYSCORE', owner_zset, '-inf', '(' .. (now_ms - owner_expire * 1000))
redis.call('EXPIRE', owner_zset, owner_expire)
return rebalance(owner_zset, queue_list_prefix, owner_expire, partition_count)
"#,
    ]
    .concat()
}

/// KEYS: owner_zset, queue_list_prefix.
/// ARGV: owner_id, owner_expire_seconds, partition_count.
pub fn exit() -> String {
    [
        REBALANCE_FN,
        r#"
local owner_zset = KEYS[1]
local queue_list_prefix = KEYS[2]
local owner_id = ARGV[1]
local owner_expire = tonumber(ARGV[2])
local partition_count = tonumber(ARGV[3])

redis.call('ZREM', owner_zset, owner_id)
redis.call('DEL', queue_list_prefix .. owner_id)
return rebalance(owner_zset, queue_list_prefix, owner_expire, partition_count)
"#,
    ]
    .concat()
}

/// KEYS: owner_zset, queue_list_prefix. ARGV: owner_id, now_ms,
/// owner_expire_seconds. Refreshes the score only when the owner still has a
/// queue_list; returns 1/0.
pub const KEEPALIVE: &str = r#"
local owner_zset = KEYS[1]
local queue_list_prefix = KEYS[2]
local owner_id = ARGV[1]
local now_ms = tonumber(ARGV[2])
local owner_expire = tonumber(ARGV[3])

if redis.call('EXISTS', queue_list_prefix .. owner_id) == 0 then
    return 0
end
redis.call('ZADD', owner_zset, now_ms, owner_id)
redis.call('EXPIRE', owner_zset, owner_expire)
return 1
"#;

/// KEYS: owner_zset, queue_list_prefix.
/// ARGV: cutoff_ms, owner_expire_seconds, partition_count.
/// Returns `{cleaned_count, owner_count, flat_assignments}`.
pub fn cleanup_inactive_owners() -> String {
    [
        REBALANCE_FN,
        r#"
local owner_zset = KEYS[1]
local queue_list_prefix = KEYS[2]
local cutoff = tonumber(ARGV[1])
local owner_expire = tonumber(ARGV[2])
local partition_count = tonumber(ARGV[3])

local stale = redis.call('ZRANGEBYSCORE', owner_zset, '-inf', '(' .. cutoff)
for _, owner in ipairs(stale) do
    redis.call('ZREM', owner_zset, owner)
    redis.call('DEL', queue_list_prefix .. owner)
end
local cleaned = #stale
if cleaned > 0 then
    local result = rebalance(owner_zset, queue_list_prefix, owner_expire, partition_count)
    return {cleaned, result[1], result[2]}
end
return {0, redis.call('ZCARD', owner_zset), {}}
"#,
    ]
    .concat()
}

/// KEYS: owner_zset, queue_list_prefix, queue_prefix, counter.
/// ARGV: partition_count, purge_all (0/1).
/// purge_all=0 deletes owner state and recomputes the counter from actual
/// partition sizes; purge_all=1 additionally deletes every partition.
pub const FORCE_CLEANUP: &str = r#"
local owner_zset = KEYS[1]
local queue_list_prefix = KEYS[2]
local queue_prefix = KEYS[3]
local counter_key = KEYS[4]
local partition_count = tonumber(ARGV[1])

local lists = redis.call('KEYS', queue_list_prefix .. '*')
for i = 1, #lists do
    redis.call('DEL', lists[i])
end
local owner_count = redis.call('ZCARD', owner_zset)
redis.call('DEL', owner_zset)

if ARGV[2] == '1' then
    for p = 1, partition_count do
        redis.call('DEL', queue_prefix .. string.format('%03d', p))
    end
    redis.call('SET', counter_key, 0)
    return partition_count
end

local total = 0
for p = 1, partition_count do
    total = total + redis.call('ZCARD', queue_prefix .. string.format('%03d', p))
end
redis.call('SET', counter_key, total)
return owner_count
"#;

/// KEYS: queue_key, counter. Returns `{size, total, min_score, max_score}`.
pub const QUEUE_STATS: &str = r#"
local size = redis.call('ZCARD', KEYS[1])
local total = tonumber(redis.call('GET', KEYS[2]) or '0')
local min_score = 0
local max_score = 0
if size > 0 then
    local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
    local tail = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
    min_score = tonumber(head[2])
    max_score = tonumber(tail[2])
end
return {size, total, min_score, max_score}
"#;

/// KEYS: queue_prefix, counter. ARGV: partition_count.
/// Returns `{counter, actual_total, global_min, global_max,
/// {name, size, min, max, ...}}`.
pub const ALL_PARTITIONS_STATS: &str = r#"
local queue_prefix = KEYS[1]
local counter_key = KEYS[2]
local partition_count = tonumber(ARGV[1])

local total = tonumber(redis.call('GET', counter_key) or '0')
local sum = 0
local gmin = -1
local gmax = -1
local flat = {}
for p = 1, partition_count do
    local name = string.format('%03d', p)
    local key = queue_prefix .. name
    local size = redis.call('ZCARD', key)
    local pmin = 0
    local pmax = 0
    if size > 0 then
        local head = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        local tail = redis.call('ZRANGE', key, -1, -1, 'WITHSCORES')
        pmin = tonumber(head[2])
        pmax = tonumber(tail[2])
        if gmin < 0 or pmin < gmin then gmin = pmin end
        if pmax > gmax then gmax = pmax end
    end
    sum = sum + size
    table.insert(flat, name)
    table.insert(flat, size)
    table.insert(flat, pmin)
    table.insert(flat, pmax)
end
if gmin < 0 then gmin = 0 end
if gmax < 0 then gmax = 0 end
return {total, sum, gmin, gmax, flat}
"#;

/// KEYS: owner_zset, queue_list_prefix.
/// ARGV: owner_expire_seconds, partition_count.
pub fn rebalance_partitions() -> String {
    [
        REBALANCE_FN,
        r#"
return rebalance(KEYS[1], KEYS[2], tonumber(ARGV[1]), tonumber(ARGV[2]))
"#,
    ]
    .concat()
}

/// KEYS: cache_key. ARGV: max_length. Trims from the lowest score down to
/// `max_length` members; returns removed count.
pub const LENGTH_TRIM: &str = r#"
local queue_key = KEYS[1]
local max_length = tonumber(ARGV[1])

local queue_length = redis.call('ZCARD', queue_key)
local cleaned = 0
if queue_length > max_length then
    local excess = queue_length - max_length
    cleaned = redis.call('ZREMRANGEBYRANK', queue_key, 0, excess - 1)
end
return cleaned
"#;

/// KEYS: cache_key. ARGV: min_score, max_score, limit (-1 = unlimited).
/// Returns members with scores, newest first.
pub const RANGE_FETCH: &str = r#"
local queue_key = KEYS[1]
local min_score = ARGV[1]
local max_score = ARGV[2]
local limit = tonumber(ARGV[3]) or -1

if limit > 0 then
    return redis.call('ZREVRANGEBYSCORE', queue_key, max_score, min_score, 'WITHSCORES', 'LIMIT', 0, limit)
end
return redis.call('ZREVRANGEBYSCORE', queue_key, max_score, min_score, 'WITHSCORES')
"#;
