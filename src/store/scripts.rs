//! Lua 脚本
//!
//! 每个脚本在 Redis 端原子执行；`MemoryKv` 在同一把锁内实现等价逻辑。

/// 递减计数器，下限为 0
///
/// KEYS[1] = 计数器键
pub const DECR_FLOOR_ZERO: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
";

/// 设置渠道默认模型：同渠道其余模型的 `is_default` 全部清除
///
/// KEYS[1] = 模型索引集合；ARGV[1] = 模型记录键前缀；ARGV[2] = 渠道；ARGV[3] = 目标模型 id。
/// 返回 1 表示目标存在于该渠道。
pub const SET_DEFAULT_MODEL: &str = r"
local ids = redis.call('SMEMBERS', KEYS[1])
local prefix = ARGV[1]
local channel = string.lower(ARGV[2])
local target = ARGV[3]
local found = 0
for _, id in ipairs(ids) do
  local key = prefix .. id
  local raw = redis.call('GET', key)
  if raw then
    local ok, record = pcall(cjson.decode, raw)
    if ok and type(record) == 'table' and string.lower(tostring(record.channel or '')) == channel then
      local is_target = (tostring(record.id) == target)
      if is_target then
        found = 1
      end
      if record.is_default ~= is_target then
        record.is_default = is_target
        redis.call('SET', key, cjson.encode(record))
      end
    end
  end
end
return found
";

/// 请求去重登记
///
/// KEYS[1] = 指纹键；ARGV[1] = 当前毫秒；ARGV[2] = 窗口毫秒；ARGV[3] = 记录 TTL 毫秒。
/// 返回 `{dup, inflight}`，两者均为 0/1。
pub const DEDUP_REGISTER: &str = r"
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local raw = redis.call('GET', KEYS[1])
if raw then
  local data = cjson.decode(raw)
  if now - data.last <= window_ms then
    local inflight = 0
    if data.inflight > 0 then
      inflight = 1
    end
    return {1, inflight}
  end
  data.last = now
  data.inflight = data.inflight + 1
  redis.call('SET', KEYS[1], cjson.encode(data), 'PX', ttl_ms)
  return {0, 0}
end
redis.call('SET', KEYS[1], cjson.encode({last = now, inflight = 1}), 'PX', ttl_ms)
return {0, 0}
";

/// 请求去重完成：在途数减一（下限 0）并刷新时间戳
///
/// KEYS[1] = 指纹键；ARGV[1] = 当前毫秒；ARGV[2] = 记录 TTL 毫秒。
pub const DEDUP_FINISH: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 0
end
local data = cjson.decode(raw)
if data.inflight > 0 then
  data.inflight = data.inflight - 1
end
data.last = tonumber(ARGV[1])
redis.call('SET', KEYS[1], cjson.encode(data), 'PX', tonumber(ARGV[2]))
return 1
";
