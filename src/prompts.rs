//! Prompt text for the chat model and the vision model.
//!
//! Callers override the instruction via
//! [`crate::config::GenerationConfigBuilder::instruction`]; everything else
//! here is fixed wire text the rest of the pipeline depends on (the sentinel
//! strings in particular).

/// Verdict the vision model is told to return for unusable images.
pub const INVALID_IMAGE_SENTINEL: &str = "无效图片，无法识别";

/// Verdict recorded for images below the size thresholds.
pub const UNDERSIZED_IMAGE_SENTINEL: &str = "这张图片不符合规定像素尺寸要求";

/// Status line emitted when an image collapses to an empty replacement.
pub const FILTERED_STATUS: &str = "invalid image, filtered";

/// Default instruction appended to every chunk request.
pub const DEFAULT_INSTRUCTION: &str = r#"Role: 测试用例设计专家

设计目标：
根据文档内容识别功能边界、业务规则、用户角色与权限、关键业务流程（正常流、备选流、异常流），
使用指定的用例设计方法尽可能多地覆盖参数组合（不少于15条）。

输出要求：
1. 格式：结构化 JSON 数组，必须严格遵守 JSON 语法，放在 ```json 代码块中
2. 不要使用 JavaScript 语法（如 .repeat()），重复字符请直接写出或用文字描述
3. 字段：
   - 用例编号：<模块缩写>-<3位序号>
   - 用例标题：<测试目标> [正例/反例]
   - 前置条件：初始化状态描述
   - 测试数据：参数值的具体组合
   - 操作步骤：带编号的明确步骤
   - 预期结果：可验证的断言
   - 优先级：P0(冒烟)/P1(核心)/P2(次要)
4. 示例：
[
    {
        "用例编号": "PAY-001",
        "用例标题": "支付功能 [正例]",
        "前置条件": "用户已登录，购物车内已有商品",
        "测试数据": {"支付方式": "支付宝支付", "金额范围": "100-1000"},
        "操作步骤": ["1. 打开购物车页面", "2. 点击结算按钮", "3. 点击支付按钮"],
        "预期结果": "支付成功，页面显示支付完成信息",
        "优先级": "P1"
    }
]"#;

/// Build the user message for one chunk.
///
/// Field labels and separators follow the format the downstream prompts
/// were tuned against: `所在行业`, `文档内容`, `生成的用例类型`,
/// `用例设计方法`, `提示词`, each terminated by `；`.
pub fn build_user_message(
    industry: &str,
    content: &str,
    output_type: &str,
    design_methods: &[String],
    instruction: &str,
) -> String {
    format!(
        "所在行业:  {industry}；文档内容： {content}； 生成的用例类型： {output_type}； 用例设计方法： {methods}； 提示词：{instruction}；",
        methods = design_methods.join("、"),
    )
}

/// Build the vision prompt for one image.
pub fn build_vision_prompt(industry: &str, width: u32, height: u32) -> String {
    format!(
        r#"你是一名图片识别专家，熟悉{industry}行业的需求文档。请分析这张来自需求文档的图片（尺寸：{width} × {height} 像素）。

强制规则（优先级最高）：
- 如果图片质量差、内容模糊、是水印、头像或无意义元素，直接回复：“{INVALID_IMAGE_SENTINEL}！”
- 只回复图片分析结果，禁止添加任何额外话术。
- 描述必须基于图片实际内容，使用中性语言，不假设内容。

分析重点：
先判断图片类型（界面截图、流程图、表格、图标、纯文字图等），再分区域描述位置、文字、颜色、交互元素；
流程图或文字图请描述其结构、箭头、文本框等元素。

回复格式：纯文本，或 JSON 对象 {{"main_content": "<分析结果>"}}。"#
    )
}
